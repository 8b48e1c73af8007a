#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::client::conn::http1;
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use parlor_client_core::{ClientSettings, Session};
use parlor_domain::{Author, MessageRecord, Username};
use parlor_protocol::Msg;
use tokio::net::TcpStream;
use tokio::time::timeout;

use parlor_server::quic::config::QuicListenerConfig;
use parlor_server::server::engine::Engine;
use parlor_server::server::http::{ApiState, bind_api_server};
use parlor_server::server::hub::{Hub, HubConfig};
use parlor_server::server::presence::PresenceRegistry;
use parlor_server::server::session::{SessionSettings, handle_session};
use parlor_server::server::store::{MessageLog, MessageStore, NewMessage, StoreError, StoreLimits};
use parlor_server::server::users::InMemoryUserDirectory;
use parlor_server::util::secret::SecretString;

const SECRET: &str = "http-test-secret";

fn init() {
	static ONCE: std::sync::OnceLock<()> = std::sync::OnceLock::new();
	ONCE.get_or_init(|| {
		let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
		if std::env::var("PARLOR_TEST_LOG").is_ok() {
			let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
		}
	});
}

fn mk_engine_with_log(log: MessageLog) -> Engine {
	Engine::new(
		log,
		Hub::new(HubConfig::default()),
		PresenceRegistry::default(),
		Arc::new(InMemoryUserDirectory::default()),
	)
}

fn mk_engine() -> Engine {
	mk_engine_with_log(MessageLog::new_in_memory(StoreLimits::default()))
}

async fn start_api(engine: Engine) -> SocketAddr {
	let state = ApiState::new(engine, SecretString::new(SECRET.to_string()));
	state.mark_ready();
	bind_api_server("127.0.0.1:0".parse().unwrap(), state)
		.await
		.expect("bind api server")
}

async fn request(
	addr: SocketAddr,
	method: Method,
	path: &str,
	body: Option<serde_json::Value>,
	bearer: Option<&str>,
) -> (StatusCode, serde_json::Value) {
	let stream = TcpStream::connect(addr).await.expect("connect");
	let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await.expect("handshake");
	tokio::spawn(async move {
		let _ = conn.await;
	});

	let mut builder = Request::builder()
		.method(method)
		.uri(path)
		.header(hyper::header::HOST, "localhost")
		.header(hyper::header::CONTENT_TYPE, "application/json");
	if let Some(token) = bearer {
		builder = builder.header(hyper::header::AUTHORIZATION, format!("Bearer {token}"));
	}

	let payload = body.map(|v| v.to_string()).unwrap_or_default();
	let req = builder.body(Full::new(Bytes::from(payload))).expect("build request");

	let res = sender.send_request(req).await.expect("send request");
	let status = res.status();
	let bytes = res.into_body().collect().await.expect("read body").to_bytes();
	let value = serde_json::from_slice(&bytes)
		.unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned()));

	(status, value)
}

async fn register(addr: SocketAddr, username: &str, password: &str) -> (StatusCode, serde_json::Value) {
	request(
		addr,
		Method::POST,
		"/api/register",
		Some(serde_json::json!({ "username": username, "password": password })),
		None,
	)
	.await
}

async fn login(addr: SocketAddr, username: &str, password: &str) -> (StatusCode, serde_json::Value) {
	request(
		addr,
		Method::POST,
		"/api/login",
		Some(serde_json::json!({ "username": username, "password": password })),
		None,
	)
	.await
}

#[tokio::test]
async fn register_issues_token_and_preserves_casing() {
	init();
	let addr = start_api(mk_engine()).await;

	let (status, body) = register(addr, "Alice", "hunter2!").await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body["user"]["username"], "Alice");
	assert!(body["user"]["id"].as_str().is_some_and(|id| !id.is_empty()));
	assert!(body["token"].as_str().is_some_and(|t| t.starts_with("v1.")));
}

#[tokio::test]
async fn duplicate_username_is_rejected_case_insensitively() {
	init();
	let addr = start_api(mk_engine()).await;

	let (status, _) = register(addr, "alice", "hunter2!").await;
	assert_eq!(status, StatusCode::OK);

	let (status, body) = register(addr, "ALICE", "other-pass").await;
	assert_eq!(status, StatusCode::CONFLICT);
	assert_eq!(body["error"], "username_taken");
}

#[tokio::test]
async fn login_checks_credentials() {
	init();
	let addr = start_api(mk_engine()).await;

	let (status, _) = register(addr, "bob", "correct-horse").await;
	assert_eq!(status, StatusCode::OK);

	let (status, body) = login(addr, "bob", "wrong-horse").await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(body["error"], "invalid_credentials");

	let (status, body) = login(addr, "bob", "correct-horse").await;
	assert_eq!(status, StatusCode::OK);
	assert!(body["token"].as_str().is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn missing_credentials_are_bad_requests() {
	init();
	let addr = start_api(mk_engine()).await;

	let (status, body) = request(addr, Method::POST, "/api/register", None, None).await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body["error"], "username_and_password_required");

	let (status, body) = request(
		addr,
		Method::POST,
		"/api/login",
		Some(serde_json::json!({ "username": "carol" })),
		None,
	)
	.await;
	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body["error"], "username_and_password_required");
}

#[tokio::test]
async fn messages_require_a_valid_bearer_token() {
	init();
	let addr = start_api(mk_engine()).await;

	let (status, body) = request(addr, Method::GET, "/api/messages", None, None).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(body["error"], "missing_token");

	let (status, body) = request(addr, Method::GET, "/api/messages", None, Some("garbage")).await;
	assert_eq!(status, StatusCode::UNAUTHORIZED);
	assert_eq!(body["error"], "invalid_token");
}

#[tokio::test]
async fn messages_return_history_for_a_registered_user() {
	init();
	let log = MessageLog::new_in_memory(StoreLimits::default());
	log.append(NewMessage {
		author: Author::User(Username::new("earlier").unwrap()),
		text: "welcome back".to_string(),
	})
	.await
	.unwrap();

	let addr = start_api(mk_engine_with_log(log)).await;

	let (status, body) = register(addr, "dave", "hunter2!").await;
	assert_eq!(status, StatusCode::OK);
	let token = body["token"].as_str().unwrap().to_string();

	let (status, body) = request(addr, Method::GET, "/api/messages", None, Some(&token)).await;
	assert_eq!(status, StatusCode::OK);

	let messages = body["messages"].as_array().expect("messages array");
	assert_eq!(messages.len(), 1);
	assert_eq!(messages[0]["user"], "earlier");
	assert_eq!(messages[0]["text"], "welcome back");
}

struct UnavailableStore;

#[async_trait::async_trait]
impl MessageStore for UnavailableStore {
	async fn append(&self, _msg: NewMessage, _limits: &StoreLimits) -> Result<MessageRecord, StoreError> {
		Err(StoreError::Unavailable("disk offline".to_string()))
	}

	async fn tail(&self, _n: usize) -> Result<Vec<MessageRecord>, StoreError> {
		Err(StoreError::Unavailable("disk offline".to_string()))
	}
}

#[tokio::test]
async fn messages_report_store_unavailable() {
	init();
	let log = MessageLog::new(Arc::new(UnavailableStore), StoreLimits::default());
	let addr = start_api(mk_engine_with_log(log)).await;

	let (status, body) = register(addr, "erin", "hunter2!").await;
	assert_eq!(status, StatusCode::OK);
	let token = body["token"].as_str().unwrap().to_string();

	let (status, body) = request(addr, Method::GET, "/api/messages", None, Some(&token)).await;
	assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
	assert_eq!(body["error"], "store_unavailable");
}

#[tokio::test]
async fn readiness_flips_with_mark_ready() {
	init();
	let state = ApiState::new(mk_engine(), SecretString::new(SECRET.to_string()));
	let addr = bind_api_server("127.0.0.1:0".parse().unwrap(), state.clone())
		.await
		.expect("bind api server");

	let (status, body) = request(addr, Method::GET, "/healthz", None, None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, serde_json::Value::String("ok".to_string()));

	let (status, _) = request(addr, Method::GET, "/readyz", None, None).await;
	assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

	state.mark_ready();

	let (status, body) = request(addr, Method::GET, "/readyz", None, None).await;
	assert_eq!(status, StatusCode::OK);
	assert_eq!(body, serde_json::Value::String("ready".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn registered_token_connects_over_quic() {
	init();
	let engine = mk_engine();
	let api_addr = start_api(engine.clone()).await;

	let quic_cfg = QuicListenerConfig::dev("127.0.0.1:0".parse().unwrap());
	let (endpoint, _cert_der) = quic_cfg.bind_dev_endpoint().unwrap();
	let quic_addr = endpoint.local_addr().unwrap();

	let settings = SessionSettings::new(SecretString::new(SECRET.to_string()));
	let next_conn_id = Arc::new(AtomicU64::new(1));
	let accept_engine = engine.clone();
	tokio::spawn(async move {
		while let Some(connecting) = endpoint.accept().await {
			let conn_id = next_conn_id.fetch_add(1, Ordering::Relaxed);
			let engine = accept_engine.clone();
			let settings = settings.clone();
			tokio::spawn(async move {
				if let Ok(connection) = connecting.await {
					let _ = handle_session(conn_id, connection, engine, settings).await;
				}
			});
		}
	});

	let (status, body) = register(api_addr, "Alice", "hunter2!").await;
	assert_eq!(status, StatusCode::OK);
	let token = body["token"].as_str().unwrap().to_string();

	let cfg = ClientSettings {
		server_host: "localhost".to_string(),
		server_port: quic_addr.port(),
		server_addr: Some(quic_addr),
		token,
		connect_timeout: Duration::from_secs(5),
		..ClientSettings::default()
	};
	let (mut session, joined) = Session::connect(cfg).await.expect("connect");
	assert!(joined.history.is_empty());

	let msg = timeout(Duration::from_secs(5), session.next_msg())
		.await
		.expect("timed out waiting for join notice")
		.expect("session error")
		.expect("session closed");
	match msg {
		Msg::Message { message } => {
			assert!(message.system);
			assert_eq!(message.text, "Alice joined the chat");
		}
		other => panic!("expected join notice, got {other:?}"),
	}
}
