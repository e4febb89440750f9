//! Raw-wire checks of the RPC dispatcher.

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use lock_server::LockServer;
use lock_wire::{ClientCodec, FaultKind, LockParams, Request, RequestId, Response};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

async fn start_server() -> std::net::SocketAddr {
	let server = LockServer::bind("127.0.0.1:0").await.unwrap();
	let addr = server.local_addr().unwrap();
	tokio::spawn(server.run());
	addr
}

#[tokio::test]
async fn unknown_methods_fault_without_closing_the_connection() {
	let addr = start_server().await;
	let socket = TcpStream::connect(addr).await.unwrap();
	let mut framed = Framed::new(socket, ClientCodec::new());

	framed
		.send(Request {
			id: RequestId::Number(1),
			method: "steal-lock".to_string(),
			params: vec![],
		})
		.await
		.unwrap();
	let response = framed.next().await.unwrap().unwrap();
	assert_eq!(response.id, RequestId::Number(1));
	assert_eq!(response.error.unwrap().kind(), Some(FaultKind::InvalidRequest));

	// The connection still serves well-formed calls afterwards.
	framed.send(Request::lock(2, &["r".to_string()], LockParams { ttl: 5.0, locking_timeout: 5.0 })).await.unwrap();
	let response = framed.next().await.unwrap().unwrap();
	assert_eq!(response.id, RequestId::Number(2));
	assert!(matches!(response.result, Some(Value::String(_))));
}

#[tokio::test]
async fn in_flight_requests_interleave_and_correlate_by_id() {
	let addr = start_server().await;
	let socket = TcpStream::connect(addr).await.unwrap();
	let mut framed = Framed::new(socket, ClientCodec::new());

	framed.send(Request::lock(1, &["a".to_string()], LockParams { ttl: 30.0, locking_timeout: 30.0 })).await.unwrap();
	let granted = framed.next().await.unwrap().unwrap();
	let Some(Value::String(lock_id)) = granted.result else {
		panic!("expected a lock id, got {granted:?}");
	};

	// A second acquire queues; the release that follows it unblocks it.
	framed.send(Request::lock(2, &["a".to_string()], LockParams { ttl: 30.0, locking_timeout: 30.0 })).await.unwrap();
	framed.send(Request::release_lock(3, &lock_id)).await.unwrap();

	let mut responses: HashMap<RequestId, Response> = HashMap::new();
	while responses.len() < 2 {
		let response = framed.next().await.unwrap().unwrap();
		responses.insert(response.id.clone(), response);
	}

	let release = &responses[&RequestId::Number(3)];
	assert!(release.error.is_none());
	let queued = &responses[&RequestId::Number(2)];
	assert!(matches!(queued.result, Some(Value::String(_))));
}

#[tokio::test]
async fn an_undecodable_frame_closes_the_connection() {
	let addr = start_server().await;
	let mut socket = TcpStream::connect(addr).await.unwrap();

	socket.write_all(&8u32.to_be_bytes()).await.unwrap();
	socket.write_all(b"not json").await.unwrap();

	let mut buffer = [0u8; 16];
	let read = socket.read(&mut buffer).await.unwrap();
	assert_eq!(read, 0);
}
