#![forbid(unsafe_code)]

use std::sync::Arc;

use parlor_domain::{Author, MessageRecord};
use tokio::sync::Mutex;
use tracing::warn;

use crate::server::hub::Hub;
use crate::server::presence::{Identity, PresenceRegistry};
use crate::server::store::{MessageLog, NewMessage, StoreError};
use crate::server::users::UserDirectory;

/// The room engine. Every message, user or system, goes through
/// `persist_and_broadcast`: append to the store, then fan out, under one
/// lock. Persisted order and broadcast order are therefore the same
/// total order, and a failed append is never broadcast.
#[derive(Clone)]
pub struct Engine {
	log: MessageLog,
	hub: Hub,
	presence: PresenceRegistry,
	users: Arc<dyn UserDirectory>,
	publish_lock: Arc<Mutex<()>>,
}

impl Engine {
	pub fn new(log: MessageLog, hub: Hub, presence: PresenceRegistry, users: Arc<dyn UserDirectory>) -> Self {
		Self {
			log,
			hub,
			presence,
			users,
			publish_lock: Arc::new(Mutex::new(())),
		}
	}

	pub fn log(&self) -> &MessageLog {
		&self.log
	}

	pub fn hub(&self) -> &Hub {
		&self.hub
	}

	pub fn presence(&self) -> &PresenceRegistry {
		&self.presence
	}

	pub fn users(&self) -> &Arc<dyn UserDirectory> {
		&self.users
	}

	/// Accept a chat message from a user. The body is trimmed; an empty
	/// result is a silent no-op (`Ok(None)`), an overlong one is
	/// truncated to the body cap.
	pub async fn publish_user(&self, identity: &Identity, text: &str) -> Result<Option<MessageRecord>, StoreError> {
		let text = text.trim();
		if text.is_empty() {
			return Ok(None);
		}

		let text = truncate_chars(text, self.log.limits().body_max_chars);
		let record = self
			.persist_and_broadcast(NewMessage {
				author: Author::User(identity.username.clone()),
				text,
			})
			.await?;

		metrics::counter!("parlor_server_messages_total").increment(1);
		Ok(Some(record))
	}

	/// Broadcast the join notice for a newly admitted session.
	pub async fn announce_join(&self, identity: &Identity) -> Result<MessageRecord, StoreError> {
		self.publish_system(format!("{} joined the chat", identity.username)).await
	}

	/// Broadcast the leave notice for a departed session.
	pub async fn announce_leave(&self, identity: &Identity) -> Result<MessageRecord, StoreError> {
		self.publish_system(format!("{} left the chat", identity.username)).await
	}

	async fn publish_system(&self, text: String) -> Result<MessageRecord, StoreError> {
		self.persist_and_broadcast(NewMessage {
			author: Author::System,
			text,
		})
		.await
	}

	async fn persist_and_broadcast(&self, msg: NewMessage) -> Result<MessageRecord, StoreError> {
		let _guard = self.publish_lock.lock().await;

		// Durable first. If the append fails nothing is broadcast.
		let record = self.log.append(msg).await.inspect_err(|e| {
			warn!(error = %e, "message dropped: store append failed");
			metrics::counter!("parlor_server_store_failures_total").increment(1);
		})?;

		self.hub.publish(record.clone()).await;
		Ok(record)
	}

	/// History window replayed to a connecting session.
	pub async fn history(&self) -> Result<Vec<MessageRecord>, StoreError> {
		self.log.history().await
	}
}

/// Truncate to at most `max` characters, on a char boundary.
fn truncate_chars(s: &str, max: usize) -> String {
	match s.char_indices().nth(max) {
		Some((idx, _)) => s[..idx].to_string(),
		None => s.to_string(),
	}
}
