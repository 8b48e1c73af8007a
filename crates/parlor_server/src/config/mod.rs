#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::{info, warn};

use crate::util::secret::SecretString;

/// Default config path: `~/.parlor/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parlor").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub limits: LimitSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// HTTP API bind address (host:port) for register/login/messages.
	pub http_bind: Option<String>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// HMAC secret for stateless bearer tokens.
	pub signing_secret: Option<SecretString>,
}

/// Room limits; defaults match the store defaults.
#[derive(Debug, Clone)]
pub struct LimitSettings {
	pub retention_cap: usize,
	pub history_window: usize,
	pub body_max_chars: usize,
	pub subscriber_queue_capacity: usize,
}

impl Default for LimitSettings {
	fn default() -> Self {
		Self {
			retention_cap: 2000,
			history_window: 200,
			body_max_chars: 1000,
			subscriber_queue_capacity: 256,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Enable the SQLite store; otherwise messages and users live in memory.
	pub enabled: bool,
	/// Database URL (sqlite:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	limits: FileLimitSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	http_bind: Option<String>,
	metrics_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	signing_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	retention_cap: Option<usize>,
	history_window: Option<usize>,
	body_max_chars: Option<usize>,
	subscriber_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = LimitSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				http_bind: file.server.http_bind.filter(|s| !s.trim().is_empty()),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			},
			auth: AuthSettings {
				signing_secret: file
					.auth
					.signing_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			limits: LimitSettings {
				retention_cap: file.limits.retention_cap.unwrap_or(defaults.retention_cap),
				history_window: file.limits.history_window.unwrap_or(defaults.history_window),
				body_max_chars: file.limits.body_max_chars.unwrap_or(defaults.body_max_chars),
				subscriber_queue_capacity: file
					.limits
					.subscriber_queue_capacity
					.unwrap_or(defaults.subscriber_queue_capacity),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLOR_AUTH_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.signing_secret = Some(SecretString::new(v));
			info!("auth: signing_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLOR_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLOR_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLOR_HTTP_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.http_bind = Some(v);
			info!("server config: http_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLOR_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLOR_RETENTION_CAP")
		&& let Ok(cap) = v.trim().parse::<usize>()
	{
		cfg.limits.retention_cap = cap;
		info!(cap, "limits: retention_cap overridden by env");
	}

	if let Ok(v) = std::env::var("PARLOR_HISTORY_WINDOW")
		&& let Ok(window) = v.trim().parse::<usize>()
	{
		cfg.limits.history_window = window;
		info!(window, "limits: history_window overridden by env");
	}

	if let Ok(v) = std::env::var("PARLOR_BODY_MAX_CHARS")
		&& let Ok(max) = v.trim().parse::<usize>()
	{
		cfg.limits.body_max_chars = max;
		info!(max, "limits: body_max_chars overridden by env");
	}

	if let Ok(v) = std::env::var("PARLOR_PERSISTENCE_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Ok(v) = std::env::var("PARLOR_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = Some(v);
			info!("persistence: database_url overridden by env");
		}
	}

	if cfg.auth.signing_secret.is_none() {
		warn!("auth: no signing_secret configured; tokens will use the dev default");
	}
}
