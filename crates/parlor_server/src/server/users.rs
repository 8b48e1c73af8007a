#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::str::FromStr;

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use parlor_domain::{UserId, Username};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::util::time::unix_ms_now;

/// A registered user. The password hash never leaves the directory.
#[derive(Debug, Clone)]
pub struct User {
	pub id: UserId,
	pub username: Username,
	pub created_at: i64,
	pub last_seen: Option<i64>,
}

#[derive(Debug, Error)]
pub enum UserError {
	#[error("username already taken")]
	UsernameTaken,
	#[error("invalid credentials")]
	InvalidCredentials,
	#[error("user directory unavailable: {0}")]
	Unavailable(String),
}

impl From<sqlx::Error> for UserError {
	fn from(err: sqlx::Error) -> Self {
		UserError::Unavailable(err.to_string())
	}
}

#[async_trait::async_trait]
pub trait UserDirectory: Send + Sync {
	/// Create a user. Usernames are unique case-insensitively; the
	/// registered casing is preserved for display.
	async fn register(&self, username: Username, password: &str) -> Result<User, UserError>;

	/// Check credentials. The same error covers unknown username and
	/// wrong password.
	async fn authenticate(&self, username: &Username, password: &str) -> Result<User, UserError>;

	/// Record the last time a user's session ended. Best effort.
	async fn touch_last_seen(&self, id: UserId, at_unix_ms: i64) -> Result<(), UserError>;
}

fn hash_password(password: &str) -> Result<String, UserError> {
	let salt = SaltString::generate(&mut OsRng);
	let hash = Argon2::default()
		.hash_password(password.as_bytes(), &salt)
		.map_err(|e| UserError::Unavailable(format!("password hash failed: {e}")))?
		.to_string();
	Ok(hash)
}

fn verify_password(stored_hash: &str, supplied_password: &str) -> bool {
	let Ok(parsed) = PasswordHash::new(stored_hash) else {
		return false;
	};
	Argon2::default()
		.verify_password(supplied_password.as_bytes(), &parsed)
		.is_ok()
}

#[derive(Debug, Clone)]
struct StoredUser {
	user: User,
	password_hash: String,
}

#[derive(Default)]
pub struct InMemoryUserDirectory {
	inner: Mutex<HashMap<String, StoredUser>>,
}

#[async_trait::async_trait]
impl UserDirectory for InMemoryUserDirectory {
	async fn register(&self, username: Username, password: &str) -> Result<User, UserError> {
		let key = username.key();
		let password_hash = hash_password(password)?;

		let mut users = self.inner.lock().await;
		if users.contains_key(&key) {
			return Err(UserError::UsernameTaken);
		}

		let user = User {
			id: UserId::new_v4(),
			username,
			created_at: unix_ms_now(),
			last_seen: None,
		};
		users.insert(
			key,
			StoredUser {
				user: user.clone(),
				password_hash,
			},
		);

		Ok(user)
	}

	async fn authenticate(&self, username: &Username, password: &str) -> Result<User, UserError> {
		let users = self.inner.lock().await;
		let Some(stored) = users.get(&username.key()) else {
			return Err(UserError::InvalidCredentials);
		};

		if !verify_password(&stored.password_hash, password) {
			return Err(UserError::InvalidCredentials);
		}

		Ok(stored.user.clone())
	}

	async fn touch_last_seen(&self, id: UserId, at_unix_ms: i64) -> Result<(), UserError> {
		let mut users = self.inner.lock().await;
		if let Some(stored) = users.values_mut().find(|s| s.user.id == id) {
			stored.user.last_seen = Some(at_unix_ms);
		}
		Ok(())
	}
}

#[derive(Clone)]
pub struct SqliteUserDirectory {
	pool: sqlx::SqlitePool,
}

impl SqliteUserDirectory {
	pub fn new(pool: sqlx::SqlitePool) -> Self {
		Self { pool }
	}
}

type UserRow = (String, String, i64, Option<i64>, String);

fn row_to_user(row: UserRow) -> Result<(User, String), UserError> {
	let (id, username, created_at, last_seen, password_hash) = row;
	let id = UserId::from_str(&id).map_err(|e| UserError::Unavailable(format!("corrupt user id: {e}")))?;
	let username = Username::new(username).map_err(|e| UserError::Unavailable(format!("corrupt username: {e}")))?;
	Ok((
		User {
			id,
			username,
			created_at,
			last_seen,
		},
		password_hash,
	))
}

#[async_trait::async_trait]
impl UserDirectory for SqliteUserDirectory {
	async fn register(&self, username: Username, password: &str) -> Result<User, UserError> {
		let password_hash = hash_password(password)?;
		let user = User {
			id: UserId::new_v4(),
			username,
			created_at: unix_ms_now(),
			last_seen: None,
		};

		let result = sqlx::query(
			"INSERT INTO users (id, username, username_key, password_hash, created_at) VALUES (?, ?, ?, ?, ?)",
		)
		.bind(user.id.to_string())
		.bind(user.username.as_str())
		.bind(user.username.key())
		.bind(&password_hash)
		.bind(user.created_at)
		.execute(&self.pool)
		.await;

		match result {
			Ok(_) => Ok(user),
			Err(e) if e.as_database_error().is_some_and(|d| d.is_unique_violation()) => Err(UserError::UsernameTaken),
			Err(e) => Err(e.into()),
		}
	}

	async fn authenticate(&self, username: &Username, password: &str) -> Result<User, UserError> {
		let row: Option<UserRow> = sqlx::query_as(
			"SELECT id, username, created_at, last_seen, password_hash FROM users WHERE username_key = ?",
		)
		.bind(username.key())
		.fetch_optional(&self.pool)
		.await?;

		let Some(row) = row else {
			return Err(UserError::InvalidCredentials);
		};

		let (user, password_hash) = row_to_user(row)?;
		if !verify_password(&password_hash, password) {
			return Err(UserError::InvalidCredentials);
		}

		Ok(user)
	}

	async fn touch_last_seen(&self, id: UserId, at_unix_ms: i64) -> Result<(), UserError> {
		sqlx::query("UPDATE users SET last_seen = ? WHERE id = ?")
			.bind(at_unix_ms)
			.bind(id.to_string())
			.execute(&self.pool)
			.await?;
		Ok(())
	}
}
