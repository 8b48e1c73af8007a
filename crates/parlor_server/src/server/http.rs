#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parlor_domain::Username;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::warn;

use crate::server::auth::{TOKEN_TTL, issue_token, verify_token};
use crate::server::engine::Engine;
use crate::server::users::UserError;
use crate::util::secret::SecretString;

/// Shared state for the HTTP API: account endpoints, read-only message
/// history, and liveness/readiness probes.
#[derive(Clone)]
pub struct ApiState {
	engine: Engine,
	auth_secret: SecretString,
	ready: Arc<AtomicBool>,
}

impl ApiState {
	pub fn new(engine: Engine, auth_secret: SecretString) -> Self {
		Self {
			engine,
			auth_secret,
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

#[derive(Debug, Deserialize)]
struct CredentialsBody {
	#[serde(default)]
	username: String,
	#[serde(default)]
	password: String,
}

#[derive(Debug, Serialize)]
struct UserBody {
	id: String,
	username: String,
}

pub fn spawn_api_server(bind: SocketAddr, state: ApiState) {
	tokio::spawn(async move {
		if let Err(err) = run_api_server(bind, state).await {
			warn!(error = %err, "api server stopped");
		}
	});
}

/// Bind the API listener and serve it in the background. Returns the bound
/// address, which matters when `bind` uses port 0.
pub async fn bind_api_server(bind: SocketAddr, state: ApiState) -> anyhow::Result<SocketAddr> {
	let listener = TcpListener::bind(bind).await?;
	let addr = listener.local_addr()?;
	tokio::spawn(async move {
		if let Err(err) = serve_connections(listener, state).await {
			warn!(error = %err, "api server stopped");
		}
	});
	Ok(addr)
}

async fn run_api_server(bind: SocketAddr, state: ApiState) -> anyhow::Result<()> {
	let listener = TcpListener::bind(bind).await?;
	serve_connections(listener, state).await
}

async fn serve_connections(listener: TcpListener, state: ApiState) -> anyhow::Result<()> {
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let state = state.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req| handle_request(req, state.clone()));
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "api connection error");
			}
		});
	}
}

async fn handle_request(req: Request<Incoming>, state: ApiState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let method = req.method().clone();
	let path = req.uri().path().to_string();

	match (method, path.as_str()) {
		(Method::GET, "/healthz") => Ok(text_response(StatusCode::OK, "ok")),
		(Method::GET, "/readyz") => {
			if state.is_ready() {
				Ok(text_response(StatusCode::OK, "ready"))
			} else {
				Ok(text_response(StatusCode::SERVICE_UNAVAILABLE, "not-ready"))
			}
		}
		(Method::POST, "/api/register") => handle_register(req, &state).await,
		(Method::POST, "/api/login") => handle_login(req, &state).await,
		(Method::GET, "/api/messages") => handle_messages(req, &state).await,
		_ => Ok(error_response(StatusCode::NOT_FOUND, "not_found")),
	}
}

async fn handle_register(req: Request<Incoming>, state: &ApiState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let Some(creds) = read_credentials(req).await? else {
		return Ok(error_response(StatusCode::BAD_REQUEST, "username_and_password_required"));
	};

	let Ok(username) = Username::new(creds.username) else {
		return Ok(error_response(StatusCode::BAD_REQUEST, "username_and_password_required"));
	};

	match state.engine.users().register(username, &creds.password).await {
		Ok(user) => Ok(session_response(state, user.id, user.username.as_str())),
		Err(UserError::UsernameTaken) => Ok(error_response(StatusCode::CONFLICT, "username_taken")),
		Err(e) => {
			warn!(error = %e, "register failed");
			Ok(error_response(StatusCode::SERVICE_UNAVAILABLE, "directory_unavailable"))
		}
	}
}

async fn handle_login(req: Request<Incoming>, state: &ApiState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let Some(creds) = read_credentials(req).await? else {
		return Ok(error_response(StatusCode::BAD_REQUEST, "username_and_password_required"));
	};

	let Ok(username) = Username::new(creds.username) else {
		return Ok(error_response(StatusCode::BAD_REQUEST, "username_and_password_required"));
	};

	match state.engine.users().authenticate(&username, &creds.password).await {
		Ok(user) => Ok(session_response(state, user.id, user.username.as_str())),
		Err(UserError::InvalidCredentials) => Ok(error_response(StatusCode::UNAUTHORIZED, "invalid_credentials")),
		Err(e) => {
			warn!(error = %e, "login failed");
			Ok(error_response(StatusCode::SERVICE_UNAVAILABLE, "directory_unavailable"))
		}
	}
}

async fn handle_messages(req: Request<Incoming>, state: &ApiState) -> Result<Response<Full<Bytes>>, hyper::Error> {
	let token = req
		.headers()
		.get(hyper::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "));

	let Some(token) = token else {
		return Ok(error_response(StatusCode::UNAUTHORIZED, "missing_token"));
	};

	if verify_token(token, state.auth_secret.expose()).is_err() {
		return Ok(error_response(StatusCode::UNAUTHORIZED, "invalid_token"));
	}

	match state.engine.history().await {
		Ok(messages) => Ok(json_response(
			StatusCode::OK,
			&serde_json::json!({ "messages": messages }),
		)),
		Err(e) => {
			warn!(error = %e, "message history failed");
			Ok(error_response(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"))
		}
	}
}

async fn read_credentials(req: Request<Incoming>) -> Result<Option<CredentialsBody>, hyper::Error> {
	let body = req.into_body().collect().await?.to_bytes();
	let Ok(creds) = serde_json::from_slice::<CredentialsBody>(&body) else {
		return Ok(None);
	};

	if creds.username.trim().is_empty() || creds.password.is_empty() {
		return Ok(None);
	}

	Ok(Some(creds))
}

fn session_response(state: &ApiState, id: parlor_domain::UserId, username: &str) -> Response<Full<Bytes>> {
	let token = issue_token(id, username, state.auth_secret.expose(), TOKEN_TTL);
	json_response(
		StatusCode::OK,
		&serde_json::json!({
			"token": token,
			"user": UserBody {
				id: id.to_string(),
				username: username.to_string(),
			},
		}),
	)
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<Full<Bytes>> {
	let body = serde_json::to_vec(value).unwrap_or_default();
	Response::builder()
		.status(status)
		.header(hyper::header::CONTENT_TYPE, "application/json")
		.body(Full::new(Bytes::from(body)))
		.unwrap()
}

fn error_response(status: StatusCode, code: &str) -> Response<Full<Bytes>> {
	json_response(status, &serde_json::json!({ "error": code }))
}

fn text_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
	Response::builder()
		.status(status)
		.body(Full::new(Bytes::from_static(body.as_bytes())))
		.unwrap()
}
