#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parlor_domain::{UserId, Username};
use tokio::sync::Mutex;
use tracing::debug;

pub type ConnId = u64;

/// The authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub user_id: UserId,
	pub username: Username,
}

/// Who is connected right now. Both directions live in one struct under
/// one lock so they cannot drift.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
	inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
	identity_by_conn: HashMap<ConnId, Identity>,
	conns_by_user: HashMap<UserId, HashSet<ConnId>>,
}

impl PresenceRegistry {
	/// Attach an identity to a connection. A connection is bound at most
	/// once for its lifetime; binding twice is a programming defect.
	pub async fn bind(&self, conn_id: ConnId, identity: Identity) {
		let mut inner = self.inner.lock().await;
		if let Some(existing) = inner.identity_by_conn.get(&conn_id) {
			panic!("connection {conn_id} already bound to {}", existing.username);
		}

		inner.conns_by_user.entry(identity.user_id).or_default().insert(conn_id);
		inner.identity_by_conn.insert(conn_id, identity);

		metrics::gauge!("parlor_server_bound_connections").set(inner.identity_by_conn.len() as f64);
	}

	/// Detach a connection. Idempotent; teardown paths call this
	/// unconditionally.
	pub async fn unbind(&self, conn_id: ConnId) -> Option<Identity> {
		let mut inner = self.inner.lock().await;
		let identity = inner.identity_by_conn.remove(&conn_id)?;

		if let Some(conns) = inner.conns_by_user.get_mut(&identity.user_id) {
			conns.remove(&conn_id);
			if conns.is_empty() {
				inner.conns_by_user.remove(&identity.user_id);
			}
		}

		metrics::gauge!("parlor_server_bound_connections").set(inner.identity_by_conn.len() as f64);
		debug!(conn_id, user = %identity.username, "presence: unbound");
		Some(identity)
	}

	pub async fn lookup(&self, conn_id: ConnId) -> Option<Identity> {
		let inner = self.inner.lock().await;
		inner.identity_by_conn.get(&conn_id).cloned()
	}

	/// Connections currently bound for a user.
	pub async fn connections_for(&self, user_id: UserId) -> usize {
		let inner = self.inner.lock().await;
		inner.conns_by_user.get(&user_id).map(|c| c.len()).unwrap_or(0)
	}

	pub async fn bound_connections(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.identity_by_conn.len()
	}
}
