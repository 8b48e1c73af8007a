#![forbid(unsafe_code)]

use std::sync::Arc;

use parlor_domain::MessageRecord;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Fan-out hub for the single chat room.
#[derive(Debug, Clone)]
pub struct Hub {
	inner: Arc<Mutex<Inner>>,
	cfg: HubConfig,
}

/// Configuration for `Hub`.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 256,
			debug_logs: false,
		}
	}
}

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum HubItem {
	Message(Box<MessageRecord>),

	/// Indicates the subscriber is lagging and items were dropped.
	Lagged {
		dropped: u64,
	},
}

#[derive(Debug, Default)]
struct Inner {
	subscribers: Vec<mpsc::Sender<HubItem>>,

	/// Pending lag markers per subscriber.
	pending_lag_by_subscriber: Vec<u64>,
}

impl Hub {
	pub fn new(cfg: HubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			cfg,
		}
	}

	/// Subscribe to the room. The receiver sees every message published
	/// after this call returns.
	pub async fn subscribe(&self) -> mpsc::Receiver<HubItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		prune_closed_subscribers(&mut inner);

		inner.subscribers.push(tx);
		inner.pending_lag_by_subscriber.push(0);

		if self.cfg.debug_logs {
			debug!(subs = inner.subscribers.len(), "hub: subscribed");
		}

		rx
	}

	/// Deliver a message to every live subscriber. A full queue drops the
	/// item for that subscriber only and records a lag marker, delivered
	/// ahead of the next message that fits; a closed receiver is pruned.
	/// Never blocks on a slow subscriber.
	pub async fn publish(&self, record: MessageRecord) {
		let item = HubItem::Message(Box::new(record));

		let mut inner = self.inner.lock().await;
		prune_closed_subscribers(&mut inner);

		let mut dropped_total: u64 = 0;

		let Inner {
			subscribers,
			pending_lag_by_subscriber,
		} = &mut *inner;

		for (idx, sub) in subscribers.iter_mut().enumerate() {
			// A pending marker goes out before the current message so the
			// receiver sees the gap where it actually happened.
			if let Some(pending) = pending_lag_by_subscriber.get_mut(idx)
				&& *pending > 0 && sub.try_send(HubItem::Lagged { dropped: *pending }).is_ok()
			{
				*pending = 0;
			}

			match sub.try_send(item.clone()) {
				Ok(()) => {}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;

					if let Some(pending) = pending_lag_by_subscriber.get_mut(idx) {
						*pending = pending.saturating_add(1);
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(&mut inner);

		if dropped_total > 0 {
			metrics::counter!("parlor_server_broadcast_drops_total").increment(dropped_total);
			if self.cfg.debug_logs {
				debug!(dropped = dropped_total, "hub: dropped due to full subscriber queues");
			}
		}
	}

	/// Number of live subscribers.
	pub async fn subscriber_count(&self) -> usize {
		let inner = self.inner.lock().await;
		inner.subscribers.iter().filter(|s| !s.is_closed()).count()
	}
}

fn prune_closed_subscribers(inner: &mut Inner) {
	if inner.subscribers.len() != inner.pending_lag_by_subscriber.len() {
		inner.pending_lag_by_subscriber.resize(inner.subscribers.len(), 0);
	}

	let mut new_subs = Vec::with_capacity(inner.subscribers.len());
	let mut new_lag = Vec::with_capacity(inner.subscribers.len());

	for (idx, s) in inner.subscribers.drain(..).enumerate() {
		if !s.is_closed() {
			new_subs.push(s);
			new_lag.push(*inner.pending_lag_by_subscriber.get(idx).unwrap_or(&0));
		}
	}

	inner.subscribers = new_subs;
	inner.pending_lag_by_subscriber = new_lag;
}
