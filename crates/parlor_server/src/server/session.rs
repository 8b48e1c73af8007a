#![forbid(unsafe_code)]

use anyhow::{Context as _, anyhow};
use parlor_domain::Username;
use parlor_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, encode_frame};
use parlor_protocol::{Envelope, Msg, error_code};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::auth::{AuthError, verify_token};
use crate::server::engine::Engine;
use crate::server::hub::HubItem;
use crate::server::presence::Identity;
use crate::util::secret::SecretString;
use crate::util::time::unix_ms_now;

/// Per-session server settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub server_name: String,
	pub max_frame_bytes: u32,
	pub auth_secret: SecretString,
}

impl SessionSettings {
	pub fn new(auth_secret: SecretString) -> Self {
		Self {
			server_name: format!("parlor-server/{}", env!("CARGO_PKG_VERSION")),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE as u32,
			auth_secret,
		}
	}
}

/// Drive one client session on its bidirectional stream: hello/auth,
/// welcome, history replay, join notice, then the steady-state loop.
/// Teardown runs on every exit path after admission.
pub async fn handle_session(
	conn_id: u64,
	connection: quinn::Connection,
	engine: Engine,
	settings: SessionSettings,
) -> anyhow::Result<()> {
	struct ConnectionGaugeGuard;
	impl Drop for ConnectionGaugeGuard {
		fn drop(&mut self) {
			metrics::gauge!("parlor_server_active_connections").decrement(1.0);
		}
	}

	metrics::gauge!("parlor_server_active_connections").increment(1.0);
	let _conn_guard = ConnectionGaugeGuard;

	let (mut control_send, mut control_recv) = connection.accept_bi().await.context("accept session stream")?;

	let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<Envelope>();
	let reader_task = tokio::spawn(async move {
		let mut buf = Vec::<u8>::with_capacity(16 * 1024);
		let mut tmp = [0u8; 8192];

		loop {
			let n = match control_recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => return Ok::<(), anyhow::Error>(()),
				Err(e) => return Err(anyhow!(e).context("session stream read failed")),
			};

			metrics::counter!("parlor_server_bytes_in_total").increment(n as u64);

			buf.extend_from_slice(&tmp[..n]);

			loop {
				match parlor_protocol::decode_frame::<Envelope>(&buf, DEFAULT_MAX_FRAME_SIZE) {
					Ok((msg, used)) => {
						buf.drain(0..used);
						metrics::counter!("parlor_server_envelopes_in_total").increment(1);

						if ctrl_tx.send(msg).is_err() {
							return Ok(());
						}
					}
					Err(parlor_protocol::FramingError::InsufficientData { .. }) => break,
					Err(e) => {
						metrics::counter!("parlor_server_decode_errors_total").increment(1);
						return Err(anyhow!(e).context("failed to decode session frame"));
					}
				}
			}
		}
	});

	let hello = match wait_for_hello(&mut ctrl_rx).await {
		HelloWait::Hello(hello) => hello,
		HelloWait::Violation => {
			warn!(conn_id, "session rejected: first frame was not hello");
			metrics::counter!("parlor_server_protocol_violations_total").increment(1);

			send_envelope(
				&mut control_send,
				Envelope::v1(Msg::Error {
					code: error_code::PROTOCOL_VIOLATION.to_string(),
					message: "first message must be hello".to_string(),
				}),
			)
			.await
			.ok();

			reader_task.abort();
			let _ = reader_task.await;
			return Ok(());
		}
		HelloWait::Closed => {
			reader_task.abort();
			let _ = reader_task.await;
			return Ok(());
		}
	};
	metrics::counter!("parlor_server_hello_total").increment(1);

	let identity = match admit(&hello.token, settings.auth_secret.expose()) {
		Ok(identity) => identity,
		Err(e) => {
			warn!(conn_id, error = %e, "session rejected: bad token");
			metrics::counter!("parlor_server_auth_rejects_total").increment(1);

			let code = match e {
				AuthError::Malformed => error_code::MALFORMED_TOKEN,
				AuthError::Invalid => error_code::UNAUTHORIZED,
			};
			send_envelope(
				&mut control_send,
				Envelope::v1(Msg::Error {
					code: code.to_string(),
					message: e.to_string(),
				}),
			)
			.await
			.ok();

			reader_task.abort();
			let _ = reader_task.await;
			return Ok(());
		}
	};

	info!(conn_id, user = %identity.username, client_name = %hello.client_name, "session admitted");

	send_envelope(
		&mut control_send,
		Envelope::v1(Msg::Welcome {
			server_name: settings.server_name.clone(),
			server_time_unix_ms: unix_ms_now(),
			history_window: engine.log().limits().history_window as u32,
			max_frame_bytes: settings.max_frame_bytes,
		}),
	)
	.await
	.context("send Welcome")?;

	engine.presence().bind(conn_id, identity.clone()).await;

	// Subscribe before the join notice publishes so this session observes
	// its own join and everything after it.
	let mut hub_rx = engine.hub().subscribe().await;

	let mut joined = false;
	let loop_result: anyhow::Result<()> = async {
		let history = match engine.history().await {
			Ok(h) => h,
			Err(e) => {
				warn!(conn_id, error = %e, "history replay failed");
				send_envelope(
					&mut control_send,
					Envelope::v1(Msg::Error {
						code: error_code::STORE_UNAVAILABLE.to_string(),
						message: "history unavailable".to_string(),
					}),
				)
				.await?;
				return Ok(());
			}
		};

		send_envelope(&mut control_send, Envelope::v1(Msg::History { messages: history })).await?;

		match engine.announce_join(&identity).await {
			Ok(_) => joined = true,
			Err(e) => {
				warn!(conn_id, error = %e, "join notice failed");
				send_envelope(
					&mut control_send,
					Envelope::v1(Msg::Error {
						code: error_code::STORE_UNAVAILABLE.to_string(),
						message: "join failed".to_string(),
					}),
				)
				.await?;
				return Ok(());
			}
		}

		loop {
			tokio::select! {
				item = hub_rx.recv() => match item {
					Some(HubItem::Message(record)) => {
						send_envelope(&mut control_send, Envelope::v1(Msg::Message { message: *record })).await?;
					}
					Some(HubItem::Lagged { dropped }) => {
						warn!(conn_id, dropped, "session lagged; messages were dropped");
						send_envelope(&mut control_send, Envelope::v1(Msg::Lagged { dropped })).await?;
					}
					None => return Ok(()),
				},

				env = ctrl_rx.recv() => {
					let Some(env) = env else { return Ok(()) };
					match env.msg {
						Msg::Publish { text } => {
							// Persist-then-broadcast; a store failure drops
							// this message for everyone, not just some.
							if let Err(e) = engine.publish_user(&identity, &text).await {
								warn!(conn_id, error = %e, "publish dropped");
							}
						}
						Msg::Ping { client_time_unix_ms } => {
							send_envelope(
								&mut control_send,
								Envelope::v1(Msg::Pong {
									client_time_unix_ms,
									server_time_unix_ms: unix_ms_now(),
								}),
							)
							.await?;
						}
						Msg::Hello { .. } => {
							debug!(conn_id, "ignoring duplicate hello");
						}
						other => {
							warn!(conn_id, "unhandled session message: {:?}", other);
						}
					}
				}
			}
		}
	}
	.await;

	// Teardown is unconditional: unbind, best-effort last-seen, and the
	// leave notice exactly once (only for sessions that fully joined).
	let removed = engine.presence().unbind(conn_id).await;
	if joined && let Some(identity) = removed {
		if let Err(e) = engine.users().touch_last_seen(identity.user_id, unix_ms_now()).await {
			warn!(conn_id, error = %e, "failed to record last seen");
		}
		if let Err(e) = engine.announce_leave(&identity).await {
			warn!(conn_id, user = %identity.username, error = %e, "leave notice failed");
		}
	}

	reader_task.abort();
	let _ = reader_task.await;

	loop_result
}

fn admit(token: &str, secret: &str) -> Result<Identity, AuthError> {
	let claims = verify_token(token, secret)?;
	let username = Username::new(claims.name).map_err(|_| AuthError::Malformed)?;
	Ok(Identity {
		user_id: claims.sub,
		username,
	})
}

enum HelloWait {
	Hello(HelloFields),
	Violation,
	Closed,
}

async fn wait_for_hello(ctrl_rx: &mut mpsc::UnboundedReceiver<Envelope>) -> HelloWait {
	match ctrl_rx.recv().await {
		Some(env) => match env.msg {
			Msg::Hello { token, client_name } => HelloWait::Hello(HelloFields { token, client_name }),
			other => {
				warn!("expected hello, got: {:?}", other);
				HelloWait::Violation
			}
		},
		None => HelloWait::Closed,
	}
}

struct HelloFields {
	token: String,
	client_name: String,
}

async fn send_envelope(send: &mut quinn::SendStream, env: Envelope) -> anyhow::Result<()> {
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	metrics::counter!("parlor_server_envelopes_out_total").increment(1);
	metrics::counter!("parlor_server_bytes_out_total").increment(frame.len() as u64);

	send.write_all(&frame).await.context("stream write")?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn hello_fields_are_extracted() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		tx.send(Envelope::v1(Msg::Hello {
			token: "v1.a.b".to_string(),
			client_name: "cli".to_string(),
		}))
		.unwrap();

		match wait_for_hello(&mut rx).await {
			HelloWait::Hello(hello) => {
				assert_eq!(hello.token, "v1.a.b");
				assert_eq!(hello.client_name, "cli");
			}
			_ => panic!("expected hello"),
		}
	}

	#[tokio::test]
	async fn non_hello_first_frame_is_a_violation() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		tx.send(Envelope::v1(Msg::Publish { text: "hi".to_string() })).unwrap();

		assert!(matches!(wait_for_hello(&mut rx).await, HelloWait::Violation));
	}

	#[tokio::test]
	async fn ping_before_hello_is_a_violation() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		tx.send(Envelope::v1(Msg::Ping { client_time_unix_ms: 1 })).unwrap();

		assert!(matches!(wait_for_hello(&mut rx).await, HelloWait::Violation));
	}

	#[tokio::test]
	async fn close_before_hello_is_not_a_violation() {
		let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
		drop(tx);

		assert!(matches!(wait_for_hello(&mut rx).await, HelloWait::Closed));
	}
}
