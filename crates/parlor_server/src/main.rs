#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use parlor_protocol::endpoint::QuicEndpoint;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use parlor_server::config::{ServerConfig, default_config_path, load_server_config_from_path};
use parlor_server::quic::config::QuicListenerConfig;
use parlor_server::server::engine::Engine;
use parlor_server::server::http::{ApiState, spawn_api_server};
use parlor_server::server::hub::{Hub, HubConfig};
use parlor_server::server::presence::PresenceRegistry;
use parlor_server::server::session::{SessionSettings, handle_session};
use parlor_server::server::store::{MessageLog, SqliteMessageStore, StoreLimits, connect_sqlite};
use parlor_server::server::users::{InMemoryUserDirectory, SqliteUserDirectory, UserDirectory};
use parlor_server::util::secret::SecretString;

/// Fallback signing secret for local development only.
const DEV_SIGNING_SECRET: &str = "parlor-dev-secret-do-not-use";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parlor_server [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:4433)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:4433".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	let addr: SocketAddr = bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	addr
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parlor_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("parlor_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

async fn build_engine(cfg: &ServerConfig) -> anyhow::Result<Engine> {
	let limits = StoreLimits {
		retention_cap: cfg.limits.retention_cap,
		history_window: cfg.limits.history_window,
		body_max_chars: cfg.limits.body_max_chars,
	};

	let hub = Hub::new(HubConfig {
		subscriber_queue_capacity: cfg.limits.subscriber_queue_capacity,
		..HubConfig::default()
	});

	let (log, users): (MessageLog, Arc<dyn UserDirectory>) = if cfg.persistence.enabled {
		let Some(database_url) = cfg.persistence.database_url.as_deref() else {
			return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
		};
		let pool = connect_sqlite(database_url).await?;
		info!(%database_url, "sqlite persistence enabled");
		(
			MessageLog::new(Arc::new(SqliteMessageStore::new(pool.clone())), limits),
			Arc::new(SqliteUserDirectory::new(pool)),
		)
	} else {
		info!("running with in-memory store (messages and accounts are lost on restart)");
		(MessageLog::new_in_memory(limits), Arc::new(InMemoryUserDirectory::default()))
	};

	Ok(Engine::new(log, hub, PresenceRegistry::default(), users))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = default_config_path()?;
	let server_cfg = load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let auth_secret = server_cfg
		.auth
		.signing_secret
		.clone()
		.unwrap_or_else(|| SecretString::new(DEV_SIGNING_SECRET.to_string()));

	let engine = build_engine(&server_cfg).await?;

	let api_state = ApiState::new(engine.clone(), auth_secret.clone());
	if let Some(bind) = server_cfg.server.http_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_api_server(addr, api_state.clone());
				info!(%addr, "http api listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid http bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicListenerConfig::dev(bind_addr);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %bind_addr,
			cert_der_len = server_cert_der.len(),
			"parlor_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	api_state.mark_ready();

	let session_settings = SessionSettings::new(auth_secret);

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("parlor_server_connections_total").increment(1);

		let engine = engine.clone();
		let session_settings = session_settings.clone();

		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");

					if let Err(e) = handle_session(conn_id, connection, engine, session_settings).await {
						warn!(conn_id, error = %e, "session handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
