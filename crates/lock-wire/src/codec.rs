use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::error::WireError;
use crate::message::{Request, Response};

/// Upper bound on one frame. Lock calls name a handful of resource ids, so
/// anything near this limit is garbage, not a legitimate message.
pub const MAX_FRAME_LEN: usize = 256 * 1024;

/// Length-prefixed JSON framing: writes `Out` values, reads `In` values.
pub struct JsonCodec<Out, In> {
	frames: LengthDelimitedCodec,
	_direction: PhantomData<fn(Out) -> In>,
}

/// Server side: reads requests, writes responses.
pub type ServerCodec = JsonCodec<Response, Request>;

/// Client side: writes requests, reads responses.
pub type ClientCodec = JsonCodec<Request, Response>;

impl<Out, In> JsonCodec<Out, In> {
	#[must_use]
	pub fn new() -> Self {
		let frames = LengthDelimitedCodec::builder().length_field_type::<u32>().max_frame_length(MAX_FRAME_LEN).new_codec();
		Self { frames, _direction: PhantomData }
	}
}

impl<Out, In> Default for JsonCodec<Out, In> {
	fn default() -> Self {
		Self::new()
	}
}

impl<Out: Serialize, In> Encoder<Out> for JsonCodec<Out, In> {
	type Error = WireError;

	fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
		let payload = serde_json::to_vec(&item)?;
		self.frames.encode(Bytes::from(payload), dst)?;
		Ok(())
	}
}

impl<Out, In: DeserializeOwned> Decoder for JsonCodec<Out, In> {
	type Item = In;
	type Error = WireError;

	fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
		let Some(frame) = self.frames.decode(src)? else {
			return Ok(None);
		};
		Ok(Some(serde_json::from_slice(&frame)?))
	}
}
