#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use parlor_domain::{Author, MessageId, MessageRecord};
use sqlx::sqlite::SqlitePoolOptions;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// Limits applied on the write path. These are the only place the
/// retention cap, history window and body cap live.
#[derive(Debug, Clone)]
pub struct StoreLimits {
	/// Maximum messages retained; older entries are evicted on write.
	pub retention_cap: usize,
	/// Messages replayed to a newly connected session.
	pub history_window: usize,
	/// Maximum message body length in characters.
	pub body_max_chars: usize,
}

impl Default for StoreLimits {
	fn default() -> Self {
		Self {
			retention_cap: 2000,
			history_window: 200,
			body_max_chars: 1000,
		}
	}
}

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("message store unavailable: {0}")]
	Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
	fn from(err: sqlx::Error) -> Self {
		StoreError::Unavailable(err.to_string())
	}
}

/// A message accepted for persistence, before the store assigns id and
/// timestamp.
#[derive(Debug, Clone)]
pub struct NewMessage {
	pub author: Author,
	pub text: String,
}

#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Persist a message. Returns the stored record once it is durable.
	/// Entries beyond `limits.retention_cap` are evicted in the same call.
	async fn append(&self, msg: NewMessage, limits: &StoreLimits) -> Result<MessageRecord, StoreError>;

	/// Most recent `n` messages, oldest first.
	async fn tail(&self, n: usize) -> Result<Vec<MessageRecord>, StoreError>;
}

fn make_record(msg: NewMessage) -> MessageRecord {
	MessageRecord {
		id: MessageId::new_v4(),
		user: msg.author.as_str().to_string(),
		system: msg.author.is_system(),
		text: msg.text,
		created_at: unix_ms_now(),
	}
}

pub struct InMemoryMessageStore {
	inner: Mutex<VecDeque<MessageRecord>>,
}

impl Default for InMemoryMessageStore {
	fn default() -> Self {
		Self {
			inner: Mutex::new(VecDeque::new()),
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryMessageStore {
	async fn append(&self, msg: NewMessage, limits: &StoreLimits) -> Result<MessageRecord, StoreError> {
		let record = make_record(msg);

		let mut buf = self.inner.lock().await;
		buf.push_back(record.clone());
		while buf.len() > limits.retention_cap {
			buf.pop_front();
		}

		Ok(record)
	}

	async fn tail(&self, n: usize) -> Result<Vec<MessageRecord>, StoreError> {
		let buf = self.inner.lock().await;
		let skip = buf.len().saturating_sub(n);
		Ok(buf.iter().skip(skip).cloned().collect())
	}
}

#[derive(Clone)]
pub struct SqliteMessageStore {
	pool: sqlx::SqlitePool,
}

impl SqliteMessageStore {
	pub fn new(pool: sqlx::SqlitePool) -> Self {
		Self { pool }
	}
}

/// Open a SQLite pool and run migrations. A single connection keeps
/// writes serialized at the database level as well.
pub async fn connect_sqlite(database_url: &str) -> Result<sqlx::SqlitePool, StoreError> {
	let pool = SqlitePoolOptions::new().max_connections(1).connect(database_url).await?;

	sqlx::migrate!("migrations/sqlite")
		.run(&pool)
		.await
		.map_err(|e| StoreError::Unavailable(e.to_string()))?;

	Ok(pool)
}

#[async_trait::async_trait]
impl MessageStore for SqliteMessageStore {
	async fn append(&self, msg: NewMessage, limits: &StoreLimits) -> Result<MessageRecord, StoreError> {
		let record = make_record(msg);

		let result = sqlx::query("INSERT INTO messages (id, user, text, created_at, system) VALUES (?, ?, ?, ?, ?)")
			.bind(record.id.to_string())
			.bind(&record.user)
			.bind(&record.text)
			.bind(record.created_at)
			.bind(record.system)
			.execute(&self.pool)
			.await?;

		let threshold = result.last_insert_rowid().saturating_sub(limits.retention_cap as i64);
		if threshold > 0 {
			sqlx::query("DELETE FROM messages WHERE seq <= ?")
				.bind(threshold)
				.execute(&self.pool)
				.await?;
		}

		Ok(record)
	}

	async fn tail(&self, n: usize) -> Result<Vec<MessageRecord>, StoreError> {
		let rows = sqlx::query_as::<_, (String, String, String, i64, bool)>(
			"SELECT id, user, text, created_at, system FROM messages ORDER BY seq DESC LIMIT ?",
		)
		.bind(n as i64)
		.fetch_all(&self.pool)
		.await?;

		let mut out = Vec::with_capacity(rows.len());
		for (id, user, text, created_at, system) in rows.into_iter().rev() {
			let id = MessageId::from_str(&id).map_err(|e| StoreError::Unavailable(format!("corrupt message id: {e}")))?;
			out.push(MessageRecord {
				id,
				user,
				text,
				created_at,
				system,
			});
		}

		Ok(out)
	}
}

/// Store backend plus limits, shared by the engine and the HTTP API.
#[derive(Clone)]
pub struct MessageLog {
	backend: Arc<dyn MessageStore>,
	limits: StoreLimits,
}

impl MessageLog {
	pub fn new(backend: Arc<dyn MessageStore>, limits: StoreLimits) -> Self {
		Self { backend, limits }
	}

	pub fn new_in_memory(limits: StoreLimits) -> Self {
		Self::new(Arc::new(InMemoryMessageStore::default()), limits)
	}

	pub fn limits(&self) -> &StoreLimits {
		&self.limits
	}

	pub async fn append(&self, msg: NewMessage) -> Result<MessageRecord, StoreError> {
		self.backend.append(msg, &self.limits).await
	}

	/// History replayed on connect: the most recent window, oldest first.
	pub async fn history(&self) -> Result<Vec<MessageRecord>, StoreError> {
		self.backend.tail(self.limits.history_window).await
	}
}
