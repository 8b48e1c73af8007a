#![forbid(unsafe_code)]

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::BytesMut;
use parlor_domain::MessageRecord;
use parlor_protocol::endpoint::QuicEndpoint;
use parlor_protocol::framing::{DEFAULT_MAX_FRAME_SIZE, FramingError, encode_frame, try_decode_frame_from_buffer};
use parlor_protocol::{Envelope, Msg};
use quinn::{ClientConfig, Endpoint, TransportConfig, VarInt};
use tracing::{debug, info};

/// Client session configuration (v1).
#[derive(Debug, Clone)]
pub struct ClientSettings {
	/// Remote server host (DNS name or IP literal).
	pub server_host: String,

	/// Remote server UDP port.
	pub server_port: u16,

	/// Resolved remote server address override.
	pub server_addr: Option<SocketAddr>,

	/// Bearer token from register/login.
	pub token: String,

	/// Client identifier reported in the hello.
	pub client_name: String,

	/// Maximum inbound/outbound frame size.
	pub max_frame_bytes: usize,

	/// Timeout for connect + handshake.
	pub connect_timeout: Duration,
}

impl ClientSettings {
	/// Parse a `quic://host:port` endpoint into `(host, port)`.
	pub fn parse_quic_endpoint(endpoint: &str) -> Result<(String, u16), ClientError> {
		let e = QuicEndpoint::parse(endpoint)
			.map_err(|msg| ClientError::Protocol(format!("invalid endpoint (expected quic://host:port): {msg}")))?;
		Ok((e.host, e.port))
	}

	/// Convenience: create a config from `quic://host:port` and a token.
	pub fn from_quic_endpoint(endpoint: &str, token: String) -> Result<Self, ClientError> {
		let (host, port) = Self::parse_quic_endpoint(endpoint)?;
		Ok(Self {
			server_host: host,
			server_port: port,
			server_addr: None,
			token,
			..Self::default()
		})
	}
}

impl Default for ClientSettings {
	fn default() -> Self {
		// Local dev default.
		Self {
			server_host: "localhost".to_string(),
			server_port: 4433,
			server_addr: Some("127.0.0.1:4433".parse().expect("valid default addr")),
			token: String::new(),
			client_name: format!("parlor-client-core/{}", env!("CARGO_PKG_VERSION")),
			max_frame_bytes: DEFAULT_MAX_FRAME_SIZE,
			connect_timeout: Duration::from_secs(15),
		}
	}
}

/// Errors for client session operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	/// QUIC endpoint setup failed.
	#[error("failed to create QUIC endpoint: {0}")]
	Endpoint(String),

	/// Connection establishment failed.
	#[error("failed to connect: {0}")]
	Connect(String),

	/// The server refused the session token.
	#[error("rejected by server ({code}): {message}")]
	Rejected { code: String, message: String },

	/// Protocol framing error.
	#[error(transparent)]
	Framing(#[from] FramingError),

	/// Protocol error (unexpected message ordering/types).
	#[error("protocol error: {0}")]
	Protocol(String),

	/// IO error.
	#[error("io error: {0}")]
	Io(String),
}

/// Connected room session. One bidirectional stream carries both the
/// client's requests and the server's message feed.
pub struct Session {
	conn: quinn::Connection,
	send: quinn::SendStream,
	recv: quinn::RecvStream,
	buf: BytesMut,
	max_frame_bytes: usize,
}

/// Handshake result: server greeting plus the replayed history window.
pub struct Joined {
	pub server_name: String,
	pub server_time_unix_ms: i64,
	pub history: Vec<MessageRecord>,
}

impl Session {
	/// Connect and perform the v1 handshake: hello, welcome, history.
	pub async fn connect(cfg: ClientSettings) -> Result<(Self, Joined), ClientError> {
		let endpoint = make_client_endpoint().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;

		let quinn_cfg = make_insecure_client_config().map_err(|e| ClientError::Endpoint(format!("{e:#}")))?;

		let connect_timeout = cfg.connect_timeout;
		let server_name = cfg.server_host.clone();

		let candidates: Vec<SocketAddr> = match cfg.server_addr {
			Some(addr) => vec![addr],
			None => {
				let hostport = format!("{}:{}", cfg.server_host, cfg.server_port);
				let addrs = hostport
					.to_socket_addrs()
					.map_err(|e| ClientError::Connect(format!("failed to resolve {hostport}: {e}")))?;

				let addrs: Vec<SocketAddr> = addrs.collect();
				if addrs.is_empty() {
					return Err(ClientError::Connect(format!("DNS resolution returned no addresses for {hostport}")));
				}
				addrs
			}
		};

		let mut last_err: Option<String> = None;
		let mut conn: Option<quinn::Connection> = None;

		for server_addr in candidates {
			let connecting = endpoint
				.connect_with(quinn_cfg.clone(), server_addr, &server_name)
				.map_err(|e| ClientError::Connect(format!("connect_with({server_addr}, sni={server_name}): {e}")))?;

			match tokio::time::timeout(connect_timeout, connecting).await {
				Ok(Ok(c)) => {
					conn = Some(c);
					break;
				}
				Ok(Err(e)) => {
					last_err = Some(format!("connect failed (addr={server_addr}, sni={server_name}): {e}"));
				}
				Err(_) => {
					last_err = Some(format!(
						"connect timeout after {connect_timeout:?} (addr={server_addr}, sni={server_name})"
					));
				}
			}
		}

		let conn = conn.ok_or_else(|| {
			ClientError::Connect(
				last_err.unwrap_or_else(|| format!("connect failed (no addresses attempted) (sni={server_name})")),
			)
		})?;

		info!(remote = %conn.remote_address(), "connected");

		let (send, recv) = tokio::time::timeout(connect_timeout, conn.open_bi())
			.await
			.map_err(|_| ClientError::Io(format!("timeout opening session stream after {connect_timeout:?}")))?
			.map_err(|e| ClientError::Io(format!("open_bi failed: {e}")))?;

		let mut session = Self {
			conn,
			send,
			recv,
			buf: BytesMut::with_capacity(16 * 1024),
			max_frame_bytes: cfg.max_frame_bytes,
		};

		session
			.write_msg(Msg::Hello {
				token: cfg.token,
				client_name: cfg.client_name,
			})
			.await
			.map_err(|e| ClientError::Io(format!("send hello failed: {e}")))?;

		let welcome = tokio::time::timeout(connect_timeout, session.read_msg())
			.await
			.map_err(|_| ClientError::Protocol(format!("timeout waiting for welcome after {connect_timeout:?}")))??;

		let (server_name, server_time_unix_ms) = match welcome {
			Some(Msg::Welcome {
				server_name,
				server_time_unix_ms,
				max_frame_bytes,
				..
			}) => {
				session.max_frame_bytes = (max_frame_bytes as usize).min(cfg.max_frame_bytes);
				(server_name, server_time_unix_ms)
			}
			Some(Msg::Error { code, message }) => return Err(ClientError::Rejected { code, message }),
			other => return Err(ClientError::Protocol(format!("expected welcome, got {other:?}"))),
		};

		debug!(server_name = %server_name, "received welcome");

		let history = tokio::time::timeout(connect_timeout, session.read_msg())
			.await
			.map_err(|_| ClientError::Protocol(format!("timeout waiting for history after {connect_timeout:?}")))??;

		let history = match history {
			Some(Msg::History { messages }) => messages,
			Some(Msg::Error { code, message }) => return Err(ClientError::Rejected { code, message }),
			other => return Err(ClientError::Protocol(format!("expected history, got {other:?}"))),
		};

		debug!(history_len = history.len(), "received history");

		Ok((
			session,
			Joined {
				server_name,
				server_time_unix_ms,
				history,
			},
		))
	}

	/// Publish a chat message to the room.
	pub async fn send_message(&mut self, text: &str) -> Result<(), ClientError> {
		self.write_msg(Msg::Publish { text: text.to_string() }).await
	}

	/// Send a keepalive ping.
	pub async fn ping(&mut self, client_time_unix_ms: i64) -> Result<(), ClientError> {
		self.write_msg(Msg::Ping { client_time_unix_ms }).await
	}

	/// Receive the next server message; `None` on clean stream close.
	pub async fn next_msg(&mut self) -> Result<Option<Msg>, ClientError> {
		let mut tmp = [0u8; 8192];

		loop {
			match try_decode_frame_from_buffer::<Envelope>(&mut self.buf, self.max_frame_bytes) {
				Ok(Some(env)) => return Ok(Some(env.msg)),
				Ok(None) => {}
				Err(e) => return Err(ClientError::Framing(e)),
			}

			let n = match self.recv.read(&mut tmp).await {
				Ok(Some(n)) => n,
				Ok(None) => {
					if self.buf.is_empty() {
						return Ok(None);
					}
					return Err(ClientError::Protocol("stream closed mid-frame".to_string()));
				}
				Err(e) => return Err(ClientError::Io(e.to_string())),
			};

			self.buf.extend_from_slice(&tmp[..n]);
		}
	}

	pub fn close(&self, code: u32, reason: &str) {
		self.conn.close(VarInt::from_u32(code), reason.as_bytes());
	}

	async fn write_msg(&mut self, msg: Msg) -> Result<(), ClientError> {
		let frame = encode_frame(&Envelope::v1(msg), self.max_frame_bytes).map_err(ClientError::Framing)?;
		self.send.write_all(&frame).await.map_err(|e| ClientError::Io(e.to_string()))?;
		Ok(())
	}

	async fn read_msg(&mut self) -> Result<Option<Msg>, ClientError> {
		match self.next_msg().await? {
			Some(msg) => Ok(Some(msg)),
			None => Err(ClientError::Protocol("stream closed before receiving full message".to_string())),
		}
	}
}

fn make_client_endpoint() -> anyhow::Result<Endpoint> {
	let addr: SocketAddr = "0.0.0.0:0".parse().expect("valid wildcard addr");
	let endpoint = Endpoint::client(addr).context("create client endpoint")?;
	Ok(endpoint)
}

/// Dev-only TLS config that skips server cert validation.
fn make_insecure_client_config() -> anyhow::Result<ClientConfig> {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

	#[derive(Debug)]
	struct NoVerifier;

	impl rustls::client::danger::ServerCertVerifier for NoVerifier {
		fn verify_server_cert(
			&self,
			_end_entity: &rustls::pki_types::CertificateDer<'_>,
			_intermediates: &[rustls::pki_types::CertificateDer<'_>],
			_server_name: &rustls::pki_types::ServerName<'_>,
			_ocsp_response: &[u8],
			_now: rustls::pki_types::UnixTime,
		) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
			Ok(rustls::client::danger::ServerCertVerified::assertion())
		}

		fn verify_tls12_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Err(rustls::Error::General("TLS1.2 not supported".into()))
		}

		fn verify_tls13_signature(
			&self,
			_message: &[u8],
			_cert: &rustls::pki_types::CertificateDer<'_>,
			_dss: &rustls::DigitallySignedStruct,
		) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
			Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
		}

		fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
			vec![
				rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
				rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA256,
				rustls::SignatureScheme::RSA_PSS_SHA384,
				rustls::SignatureScheme::RSA_PSS_SHA512,
				rustls::SignatureScheme::ED25519,
			]
		}
	}

	let mut tls = rustls::ClientConfig::builder()
		.with_root_certificates(rustls::RootCertStore::empty())
		.with_no_client_auth();

	tls.dangerous().set_certificate_verifier(Arc::new(NoVerifier));
	tls.alpn_protocols = vec![b"parlor-v1".to_vec()];

	let quic_tls = quinn::crypto::rustls::QuicClientConfig::try_from(tls)?;

	let mut cfg = ClientConfig::new(Arc::new(quic_tls));

	let mut transport = TransportConfig::default();
	transport.max_concurrent_bidi_streams(VarInt::from_u32(4));
	transport.max_concurrent_uni_streams(VarInt::from_u32(0));
	cfg.transport_config(Arc::new(transport));

	Ok(cfg)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_is_sane() {
		let cfg = ClientSettings::default();
		assert_eq!(cfg.server_host, "localhost");
		assert!(cfg.max_frame_bytes > 0);
	}

	#[test]
	fn from_quic_endpoint_fills_host_and_port() {
		let cfg = ClientSettings::from_quic_endpoint("quic://parlor.example.com:443", "tok".to_string()).unwrap();
		assert_eq!(cfg.server_host, "parlor.example.com");
		assert_eq!(cfg.server_port, 443);
		assert!(cfg.server_addr.is_none());
		assert_eq!(cfg.token, "tok");
	}
}
