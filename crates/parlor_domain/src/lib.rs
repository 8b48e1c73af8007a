#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Author name used for server-generated notices.
pub const SYSTEM_AUTHOR: &str = "system";

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Server-assigned user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub uuid::Uuid);

impl UserId {
	/// Create a new random user id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected uuid, got {s}")))
	}
}

/// Display name chosen at registration. Uniqueness is case-insensitive;
/// the original casing is preserved for display.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Username(String);

impl Username {
	/// Create a non-empty `Username` (surrounding whitespace stripped).
	pub fn new(name: impl Into<String>) -> Result<Self, ParseIdError> {
		let name: String = name.into();
		let name = name.trim();
		if name.is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(name.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Lowercased key used for case-insensitive uniqueness.
	pub fn key(&self) -> String {
		self.0.to_lowercase()
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for Username {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for Username {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Username::new(s)
	}
}

/// Server-assigned message identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|_| ParseIdError::InvalidFormat(format!("expected uuid, got {s}")))
	}
}

/// Message author: a registered user or the server itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Author {
	User(Username),
	System,
}

impl Author {
	pub fn as_str(&self) -> &str {
		match self {
			Author::User(name) => name.as_str(),
			Author::System => SYSTEM_AUTHOR,
		}
	}

	pub const fn is_system(&self) -> bool {
		matches!(self, Author::System)
	}
}

impl fmt::Display for Author {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// A stored chat message as it appears on the wire and in history replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
	pub id: MessageId,
	pub user: String,
	pub text: String,
	/// Unix timestamp in milliseconds.
	pub created_at: i64,
	#[serde(default)]
	pub system: bool,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn username_preserves_casing_and_lowercases_key() {
		let u = Username::new("Alice").unwrap();
		assert_eq!(u.as_str(), "Alice");
		assert_eq!(u.key(), "alice");
		assert_eq!(u.key(), Username::new("aLiCe").unwrap().key());
	}

	#[test]
	fn username_trims_and_rejects_empty() {
		assert_eq!(Username::new("  bob  ").unwrap().as_str(), "bob");
		assert!(Username::new("").is_err());
		assert!(Username::new("   ").is_err());
	}

	#[test]
	fn ids_parse_roundtrip() {
		let id = MessageId::new_v4();
		assert_eq!(id.to_string().parse::<MessageId>().unwrap(), id);

		let uid = UserId::new_v4();
		assert_eq!(uid.to_string().parse::<UserId>().unwrap(), uid);

		assert!("not-a-uuid".parse::<MessageId>().is_err());
		assert!("".parse::<UserId>().is_err());
	}

	#[test]
	fn author_sentinel() {
		assert_eq!(Author::System.as_str(), SYSTEM_AUTHOR);
		assert!(Author::System.is_system());
		let a = Author::User(Username::new("carol").unwrap());
		assert_eq!(a.as_str(), "carol");
		assert!(!a.is_system());
	}

	#[test]
	fn message_record_wire_shape_is_camel_case() {
		let rec = MessageRecord {
			id: MessageId::new_v4(),
			user: "system".to_string(),
			text: "alice joined the chat".to_string(),
			created_at: 1_700_000_000_000,
			system: true,
		};

		let v: serde_json::Value = serde_json::to_value(&rec).unwrap();
		assert!(v.get("createdAt").is_some());
		assert!(v.get("created_at").is_none());
		assert_eq!(v["system"], serde_json::json!(true));
	}

	#[test]
	fn message_record_system_defaults_false() {
		let rec: MessageRecord = serde_json::from_str(
			r#"{"id":"7e2f0a93-6f58-4c5e-9a39-2f6f8a3a5f10","user":"alice","text":"hi","createdAt":1}"#,
		)
		.unwrap();
		assert!(!rec.system);
	}
}
