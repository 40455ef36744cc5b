#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use roomcast_domain::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.roomcast/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".roomcast").join("config.toml"))
}

/// Load the server config from TOML at `path` (missing file means defaults), then env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);
	apply_env_overrides(&mut cfg);
	Ok(cfg)
}

#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	/// Name reported in `Welcome`.
	pub server_name: String,
	pub server: ServerSettings,
	pub persistence: PersistenceSettings,
	pub access: AccessSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
	/// HMAC secret for bearer tokens. Without it every `Hello` is rejected.
	pub auth_hmac_secret: Option<SecretString>,
	pub heartbeat_timeout: Duration,
	pub resume_grace: Duration,
	pub room_idle_grace: Duration,
	pub outbound_queue_capacity: usize,
	pub max_message_bytes: usize,
	pub history_page_limit: usize,
	pub send_rate_limit_burst: u32,
	pub send_rate_limit_per_minute: u32,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			health_bind: None,
			auth_hmac_secret: None,
			heartbeat_timeout: Duration::from_secs(30),
			resume_grace: Duration::from_secs(120),
			room_idle_grace: Duration::from_secs(60),
			outbound_queue_capacity: 1024,
			max_message_bytes: 4096,
			history_page_limit: 500,
			send_rate_limit_burst: 20,
			send_rate_limit_per_minute: 120,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Use the sqlite history store instead of the in-memory one.
	pub enabled: bool,
	/// sqlite URL, e.g. `sqlite://roomcast.db?mode=rwc`.
	pub database_url: Option<String>,
}

/// Backing data for room authorization.
#[derive(Debug, Clone)]
pub struct AccessSettings {
	/// Rooms not listed in `rooms` are open to every authenticated user.
	pub default_open: bool,
	/// room id -> user ids allowed to join.
	pub rooms: BTreeMap<String, BTreeSet<String>>,
}

impl Default for AccessSettings {
	fn default() -> Self {
		Self {
			default_open: true,
			rooms: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	server_name: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	access: FileAccessSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
	auth_hmac_secret: Option<String>,
	heartbeat_timeout_secs: Option<u64>,
	resume_grace_secs: Option<u64>,
	room_idle_grace_secs: Option<u64>,
	outbound_queue_capacity: Option<usize>,
	max_message_bytes: Option<usize>,
	history_page_limit: Option<usize>,
	send_rate_limit_burst: Option<u32>,
	send_rate_limit_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAccessSettings {
	default_open: Option<bool>,
	#[serde(default)]
	rooms: BTreeMap<String, Vec<String>>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.filter(|s| !s.trim().is_empty())
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let d = ServerSettings::default();
		let s = file.server;

		let rooms = file
			.access
			.rooms
			.into_iter()
			.map(|(room, users)| {
				let users = users
					.into_iter()
					.map(|u| u.trim().to_string())
					.filter(|u| !u.is_empty())
					.collect();
				(room.trim().to_string(), users)
			})
			.collect();

		Self {
			server_name: non_empty(file.server_name).unwrap_or_else(|| "roomcast".to_string()),
			server: ServerSettings {
				tls_cert_path: non_empty(s.tls_cert_path).map(PathBuf::from),
				tls_key_path: non_empty(s.tls_key_path).map(PathBuf::from),
				metrics_bind: non_empty(s.metrics_bind),
				health_bind: non_empty(s.health_bind),
				auth_hmac_secret: non_empty(s.auth_hmac_secret).map(SecretString::new),
				heartbeat_timeout: s
					.heartbeat_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(d.heartbeat_timeout),
				resume_grace: s.resume_grace_secs.map(Duration::from_secs).unwrap_or(d.resume_grace),
				room_idle_grace: s.room_idle_grace_secs.map(Duration::from_secs).unwrap_or(d.room_idle_grace),
				outbound_queue_capacity: s
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(d.outbound_queue_capacity),
				max_message_bytes: s.max_message_bytes.filter(|v| *v > 0).unwrap_or(d.max_message_bytes),
				history_page_limit: s.history_page_limit.filter(|v| *v > 0).unwrap_or(d.history_page_limit),
				send_rate_limit_burst: s.send_rate_limit_burst.unwrap_or(d.send_rate_limit_burst),
				send_rate_limit_per_minute: s.send_rate_limit_per_minute.unwrap_or(d.send_rate_limit_per_minute),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: non_empty(file.persistence.database_url),
			},
			access: AccessSettings {
				default_open: file.access.default_open.unwrap_or(true),
				rooms,
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

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
	let raw = env_string(key)?;
	match raw.parse::<T>() {
		Ok(v) => Some(v),
		Err(_) => {
			warn!(key, value = %raw, "ignoring unparsable env override");
			None
		}
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Some(v) = env_string("ROOMCAST_SERVER_NAME") {
		cfg.server_name = v;
		info!("server config: server_name overridden by env");
	}

	if let Some(v) = env_string("ROOMCAST_TLS_CERT") {
		cfg.server.tls_cert_path = Some(PathBuf::from(v));
		info!("server config: tls_cert_path overridden by env");
	}

	if let Some(v) = env_string("ROOMCAST_TLS_KEY") {
		cfg.server.tls_key_path = Some(PathBuf::from(v));
		info!("server config: tls_key_path overridden by env");
	}

	if let Some(v) = env_string("ROOMCAST_AUTH_HMAC_SECRET") {
		cfg.server.auth_hmac_secret = Some(SecretString::new(v));
		info!("server auth: auth_hmac_secret overridden by env");
	}

	if let Some(v) = env_string("ROOMCAST_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = env_string("ROOMCAST_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("ROOMCAST_HEARTBEAT_TIMEOUT_SECS").filter(|v| *v > 0) {
		cfg.server.heartbeat_timeout = Duration::from_secs(secs);
		info!(secs, "server config: heartbeat_timeout overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("ROOMCAST_RESUME_GRACE_SECS") {
		cfg.server.resume_grace = Duration::from_secs(secs);
		info!(secs, "server config: resume_grace overridden by env");
	}

	if let Some(secs) = env_parse::<u64>("ROOMCAST_ROOM_IDLE_GRACE_SECS") {
		cfg.server.room_idle_grace = Duration::from_secs(secs);
		info!(secs, "server config: room_idle_grace overridden by env");
	}

	if let Some(capacity) = env_parse::<usize>("ROOMCAST_OUTBOUND_QUEUE_CAPACITY").filter(|v| *v > 0) {
		cfg.server.outbound_queue_capacity = capacity;
		info!(capacity, "server config: outbound_queue_capacity overridden by env");
	}

	if let Some(bytes) = env_parse::<usize>("ROOMCAST_MAX_MESSAGE_BYTES").filter(|v| *v > 0) {
		cfg.server.max_message_bytes = bytes;
		info!(bytes, "server config: max_message_bytes overridden by env");
	}

	if let Some(limit) = env_parse::<usize>("ROOMCAST_HISTORY_PAGE_LIMIT").filter(|v| *v > 0) {
		cfg.server.history_page_limit = limit;
		info!(limit, "server config: history_page_limit overridden by env");
	}

	if let Some(burst) = env_parse::<u32>("ROOMCAST_SEND_RATE_LIMIT_BURST") {
		cfg.server.send_rate_limit_burst = burst;
		info!(burst, "server config: send_rate_limit_burst overridden by env");
	}

	if let Some(rate) = env_parse::<u32>("ROOMCAST_SEND_RATE_LIMIT_PER_MINUTE") {
		cfg.server.send_rate_limit_per_minute = rate;
		info!(rate, "server config: send_rate_limit_per_minute overridden by env");
	}

	if let Some(enabled) = env_string("ROOMCAST_PERSISTENCE_ENABLED").and_then(|v| parse_env_bool(&v)) {
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = env_string("ROOMCAST_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(open) = env_string("ROOMCAST_ACCESS_DEFAULT_OPEN").and_then(|v| parse_env_bool(&v)) {
		cfg.access.default_open = open;
		info!(default_open = open, "access: default_open overridden by env");
	}

	if cfg.server.auth_hmac_secret.is_none() {
		warn!("server auth: no auth_hmac_secret configured; every client will be rejected");
	}

	if cfg.persistence.enabled && cfg.persistence.database_url.is_none() {
		warn!("persistence: enabled without database_url; history will not be durable");
	}
}
