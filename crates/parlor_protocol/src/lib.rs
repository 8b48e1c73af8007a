#![forbid(unsafe_code)]

pub mod endpoint;
pub mod framing;

use parlor_domain::MessageRecord;
use serde::{Deserialize, Serialize};

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, decode_frame, encode_frame, encode_frame_default, encode_frame_into,
	frame_len_from_payload_len, try_decode_frame_from_buffer,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version (v1).
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}

/// Stable error codes carried in `Msg::Error`.
pub mod error_code {
	/// Token signature or expiry check failed.
	pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
	/// Token could not be decoded at all.
	pub const MALFORMED_TOKEN: &str = "MALFORMED_TOKEN";
	/// Message store unreachable or failing.
	pub const STORE_UNAVAILABLE: &str = "STORE_UNAVAILABLE";
	/// Peer sent something other than `hello` first.
	pub const PROTOCOL_VIOLATION: &str = "PROTOCOL_VIOLATION";
}

/// Top-level frame payload. Every frame on the session stream is one
/// `Envelope`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
	pub version: u32,
	#[serde(flatten)]
	pub msg: Msg,
}

impl Envelope {
	/// Wrap a message with the current protocol version.
	pub fn v1(msg: Msg) -> Self {
		Self {
			version: version::PROTOCOL_MAJOR,
			msg,
		}
	}
}

/// Session messages, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Msg {
	// client -> server
	Hello {
		token: String,
		#[serde(default)]
		client_name: String,
	},
	Publish {
		text: String,
	},
	Ping {
		client_time_unix_ms: i64,
	},

	// server -> client
	Welcome {
		server_name: String,
		server_time_unix_ms: i64,
		history_window: u32,
		max_frame_bytes: u32,
	},
	History {
		messages: Vec<MessageRecord>,
	},
	Message {
		message: MessageRecord,
	},
	Pong {
		client_time_unix_ms: i64,
		server_time_unix_ms: i64,
	},
	Lagged {
		dropped: u64,
	},
	Error {
		code: String,
		message: String,
	},
}

#[cfg(test)]
mod tests {
	use parlor_domain::MessageId;

	use super::*;

	#[test]
	fn envelope_tags_messages_by_type() {
		let env = Envelope::v1(Msg::Hello {
			token: "v1.x.y".to_string(),
			client_name: String::new(),
		});

		let v: serde_json::Value = serde_json::to_value(&env).unwrap();
		assert_eq!(v["version"], serde_json::json!(1));
		assert_eq!(v["type"], serde_json::json!("hello"));
		assert_eq!(v["token"], serde_json::json!("v1.x.y"));
	}

	#[test]
	fn message_envelope_carries_wire_record() {
		let env = Envelope::v1(Msg::Message {
			message: MessageRecord {
				id: MessageId::new_v4(),
				user: "alice".to_string(),
				text: "hi".to_string(),
				created_at: 42,
				system: false,
			},
		});

		let v: serde_json::Value = serde_json::to_value(&env).unwrap();
		assert_eq!(v["type"], serde_json::json!("message"));
		assert_eq!(v["message"]["user"], serde_json::json!("alice"));
		assert_eq!(v["message"]["createdAt"], serde_json::json!(42));
	}

	#[test]
	fn unknown_hello_fields_are_tolerated() {
		let env: Envelope =
			serde_json::from_str(r#"{"version":1,"type":"hello","token":"t","future_field":true}"#).unwrap();
		match env.msg {
			Msg::Hello { token, .. } => assert_eq!(token, "t"),
			other => panic!("unexpected msg: {other:?}"),
		}
	}
}
