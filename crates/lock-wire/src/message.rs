use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const METHOD_LOCK: &str = "lock";
pub const METHOD_EXTEND_LOCK: &str = "extend-lock";
pub const METHOD_RELEASE_LOCK: &str = "release-lock";

/// Correlation id of one request/response pair. Integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
	Number(u64),
	Text(String),
}

impl From<u64> for RequestId {
	fn from(id: u64) -> Self {
		Self::Number(id)
	}
}

impl From<String> for RequestId {
	fn from(id: String) -> Self {
		Self::Text(id)
	}
}

/// One RPC call as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
	pub id: RequestId,
	pub method: String,
	#[serde(default)]
	pub params: Vec<Value>,
}

/// Options carried by a `lock` call. Durations are seconds, fractions allowed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockParams {
	pub ttl: f64,
	pub locking_timeout: f64,
}

/// A validated, typed view of a request's method and params.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
	Lock { resources: Vec<String>, params: LockParams },
	ExtendLock { lock_id: String, ttl: Option<f64> },
	ReleaseLock { lock_id: String },
}

impl Request {
	#[must_use]
	pub fn lock(id: impl Into<RequestId>, resources: &[String], params: LockParams) -> Self {
		Self {
			id: id.into(),
			method: METHOD_LOCK.to_string(),
			params: vec![json!(resources), json!(params)],
		}
	}

	#[must_use]
	pub fn extend_lock(id: impl Into<RequestId>, lock_id: &str, ttl: Option<f64>) -> Self {
		let mut params = vec![json!(lock_id)];
		if let Some(ttl) = ttl {
			params.push(json!(ttl));
		}
		Self {
			id: id.into(),
			method: METHOD_EXTEND_LOCK.to_string(),
			params,
		}
	}

	#[must_use]
	pub fn release_lock(id: impl Into<RequestId>, lock_id: &str) -> Self {
		Self {
			id: id.into(),
			method: METHOD_RELEASE_LOCK.to_string(),
			params: vec![json!(lock_id)],
		}
	}

	/// Parses the method and params into a typed [`Call`].
	///
	/// Unknown methods and malformed params come back as invalid-request
	/// faults ready to be sent to the caller.
	pub fn call(&self) -> std::result::Result<Call, Fault> {
		match self.method.as_str() {
			METHOD_LOCK => Ok(Call::Lock {
				resources: param(&self.params, 0, "resource list")?,
				params: param(&self.params, 1, "lock options")?,
			}),
			METHOD_EXTEND_LOCK => {
				let ttl = match self.params.get(1) {
					None | Some(Value::Null) => None,
					Some(_) => Some(param(&self.params, 1, "ttl")?),
				};
				Ok(Call::ExtendLock {
					lock_id: param(&self.params, 0, "lock id")?,
					ttl,
				})
			}
			METHOD_RELEASE_LOCK => Ok(Call::ReleaseLock {
				lock_id: param(&self.params, 0, "lock id")?,
			}),
			other => Err(Fault::invalid_request(format!("unknown method `{other}`"))),
		}
	}
}

fn param<T: DeserializeOwned>(params: &[Value], index: usize, what: &str) -> std::result::Result<T, Fault> {
	let value = params.get(index).ok_or_else(|| Fault::invalid_request(format!("missing {what}")))?;
	serde_json::from_value(value.clone()).map_err(|_| Fault::invalid_request(format!("malformed {what}")))
}

/// Reply to a [`Request`], correlated by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub id: RequestId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub result: Option<Value>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub error: Option<Fault>,
}

impl Response {
	#[must_use]
	pub fn ok(id: RequestId, result: Value) -> Self {
		Self { id, result: Some(result), error: None }
	}

	#[must_use]
	pub fn fail(id: RequestId, fault: Fault) -> Self {
		Self { id, result: None, error: Some(fault) }
	}
}

/// Canonical names of the faults both peers understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
	LockingTimeout,
	UnknownLock,
	NotOwner,
	InvalidRequest,
}

impl FaultKind {
	#[must_use]
	pub fn name(self) -> &'static str {
		match self {
			Self::LockingTimeout => "LockingTimeout",
			Self::UnknownLock => "UnknownLock",
			Self::NotOwner => "NotOwner",
			Self::InvalidRequest => "InvalidRequest",
		}
	}

	#[must_use]
	pub fn from_name(name: &str) -> Option<Self> {
		match name {
			"LockingTimeout" => Some(Self::LockingTimeout),
			"UnknownLock" => Some(Self::UnknownLock),
			"NotOwner" => Some(Self::NotOwner),
			"InvalidRequest" => Some(Self::InvalidRequest),
			_ => None,
		}
	}
}

/// Error payload of a failed response.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct Fault {
	pub name: String,
	pub message: String,
}

impl Fault {
	#[must_use]
	pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
		Self {
			name: kind.name().to_string(),
			message: message.into(),
		}
	}

	#[must_use]
	pub fn invalid_request(message: impl Into<String>) -> Self {
		Self::new(FaultKind::InvalidRequest, message)
	}

	/// The typed kind, when the name is one of the canonical ones.
	#[must_use]
	pub fn kind(&self) -> Option<FaultKind> {
		FaultKind::from_name(&self.name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lock_request_uses_camel_case_options() {
		let request = Request::lock(7, &["a".to_string(), "b".to_string()], LockParams { ttl: 10.0, locking_timeout: 2.5 });
		let encoded = serde_json::to_value(&request).unwrap();
		assert_eq!(
			encoded,
			json!({
				"id": 7,
				"method": "lock",
				"params": [["a", "b"], {"ttl": 10.0, "lockingTimeout": 2.5}],
			})
		);
	}

	#[test]
	fn request_id_accepts_numbers_and_strings() {
		let numeric: Request = serde_json::from_value(json!({"id": 3, "method": "release-lock", "params": ["x"]})).unwrap();
		assert_eq!(numeric.id, RequestId::Number(3));

		let text: Request = serde_json::from_value(json!({"id": "abc", "method": "release-lock", "params": ["x"]})).unwrap();
		assert_eq!(text.id, RequestId::Text("abc".to_string()));
	}

	#[test]
	fn call_parses_each_method() {
		let lock = Request::lock(1, &["r".to_string()], LockParams { ttl: 1.0, locking_timeout: 1.0 });
		assert!(matches!(lock.call().unwrap(), Call::Lock { resources, .. } if resources == vec!["r".to_string()]));

		let bare_extend = Request::extend_lock(2, "id-1", None);
		assert_eq!(bare_extend.call().unwrap(), Call::ExtendLock { lock_id: "id-1".to_string(), ttl: None });

		let extend = Request::extend_lock(3, "id-1", Some(4.0));
		assert_eq!(extend.call().unwrap(), Call::ExtendLock { lock_id: "id-1".to_string(), ttl: Some(4.0) });

		let release = Request::release_lock(4, "id-1");
		assert_eq!(release.call().unwrap(), Call::ReleaseLock { lock_id: "id-1".to_string() });
	}

	#[test]
	fn call_rejects_unknown_method_and_bad_params() {
		let unknown = Request {
			id: RequestId::Number(1),
			method: "steal-lock".to_string(),
			params: vec![],
		};
		assert_eq!(unknown.call().unwrap_err().kind(), Some(FaultKind::InvalidRequest));

		let missing = Request {
			id: RequestId::Number(2),
			method: METHOD_LOCK.to_string(),
			params: vec![json!(["a"])],
		};
		assert_eq!(missing.call().unwrap_err().kind(), Some(FaultKind::InvalidRequest));

		let malformed = Request {
			id: RequestId::Number(3),
			method: METHOD_LOCK.to_string(),
			params: vec![json!(42), json!({"ttl": 1.0, "lockingTimeout": 1.0})],
		};
		assert_eq!(malformed.call().unwrap_err().kind(), Some(FaultKind::InvalidRequest));
	}

	#[test]
	fn error_response_carries_name_and_message() {
		let response = Response::fail(RequestId::Number(9), Fault::new(FaultKind::NotOwner, "lock is owned by another connection"));
		let encoded = serde_json::to_value(&response).unwrap();
		assert_eq!(
			encoded,
			json!({
				"id": 9,
				"error": {"name": "NotOwner", "message": "lock is owned by another connection"},
			})
		);
	}
}
