#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use roomcast_util::endpoint::{DEFAULT_ENDPOINT, QuicEndpoint};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::ServerConfig;
use crate::quic::config::QuicServerConfig;
use crate::server::access::RoomAccess;
use crate::server::auth::issue_hmac_token;
use crate::server::connection::handle_connection;
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::history::{HistoryService, SqliteHistoryStore};
use crate::server::lifecycle::{SessionManager, SessionManagerConfig};

const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: roomcast_server [--bind quic://host:port] [--config path]\n\
\x20      roomcast_server --mint-token <user> [--ttl-secs N] [--config path]\n\
\n\
Options:\n\
\t--bind        Bind endpoint (default: {DEFAULT_ENDPOINT})\n\
\t              Format: quic://host:port\n\
\t--config      Config file (default: ~/.roomcast/config.toml)\n\
\t--mint-token  Print a bearer token for <user> signed with the configured secret, then exit\n\
\t--ttl-secs    Token lifetime for --mint-token (default: {DEFAULT_TOKEN_TTL_SECS})\n\
\t--help        Show this help\n\
"
	);
	std::process::exit(2)
}

struct Args {
	bind: SocketAddr,
	config_path: Option<PathBuf>,
	mint_token: Option<String>,
	ttl_secs: u64,
}

fn parse_args() -> Args {
	let mut bind_endpoint = DEFAULT_ENDPOINT.to_string();
	let mut config_path = None;
	let mut mint_token = None;
	let mut ttl_secs = DEFAULT_TOKEN_TTL_SECS;

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
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				config_path = Some(PathBuf::from(v));
			}
			"--mint-token" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--mint-token needs a user id");
					usage_and_exit();
				}
				mint_token = Some(v);
			}
			"--ttl-secs" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				ttl_secs = v.parse().unwrap_or_else(|_| {
					eprintln!("Invalid --ttl-secs value: {v}");
					usage_and_exit()
				});
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

	let bind = bind.socket_addr().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	Args {
		bind,
		config_path,
		mint_token,
		ttl_secs,
	}
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,roomcast_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("roomcast_server");
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

	match bind.parse::<SocketAddr>() {
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

async fn build_history(cfg: &ServerConfig) -> anyhow::Result<HistoryService> {
	if !cfg.persistence.enabled {
		info!("history store: in-memory");
		return Ok(HistoryService::in_memory());
	}

	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow::anyhow!("persistence enabled but no database_url configured"));
	};
	let store = SqliteHistoryStore::connect(database_url).await?;
	info!(database_url, "history store: sqlite");
	Ok(HistoryService::new(Arc::new(store)))
}

fn mint_token(cfg: &ServerConfig, user: &str, ttl_secs: u64) -> anyhow::Result<()> {
	let Some(secret) = cfg.server.auth_hmac_secret.as_ref() else {
		return Err(anyhow::anyhow!(
			"no auth_hmac_secret configured (set server.auth_hmac_secret or ROOMCAST_AUTH_HMAC_SECRET)"
		));
	};
	println!("{}", issue_hmac_token(user.trim(), ttl_secs, secret.expose())?);
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(p) => p,
		None => crate::config::default_config_path()?,
	};
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;

	if let Some(user) = args.mint_token.as_deref() {
		return mint_token(&server_cfg, user, args.ttl_secs);
	}

	init_tracing();
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let history = build_history(&server_cfg).await?;
	let access = RoomAccess::from_settings(&server_cfg.access);
	let manager = Arc::new(SessionManager::new(
		SessionManagerConfig::from(&server_cfg),
		history,
		access,
	));
	let sweeper = manager.spawn_sweeper();

	let health_state = HealthState::new(Arc::clone(&manager));
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicServerConfig::new(args.bind, server_cfg.server.heartbeat_timeout);
	let endpoint = if let (Some(cert_path), Some(key_path)) = (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		info!(cert = %cert_path.display(), key = %key_path.display(), "loading TLS cert/key");
		quic_cfg.bind_endpoint_with_tls(cert_path, key_path)?
	} else {
		let (endpoint, server_cert_der) = quic_cfg.bind_dev_endpoint()?;
		info!(
			bind = %args.bind,
			cert_der_len = server_cert_der.len(),
			"roomcast_server: QUIC endpoint ready (dev self-signed cert)"
		);
		endpoint
	};

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let connecting = tokio::select! {
			c = endpoint.accept() => match c {
				Some(c) => c,
				None => break,
			},
			res = tokio::signal::ctrl_c() => {
				if let Err(e) = res {
					warn!(error = %e, "failed to listen for ctrl-c");
				}
				info!("shutdown requested");
				break;
			}
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("roomcast_server_connections_total").increment(1);

		let manager = Arc::clone(&manager);
		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, manager).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	health_state.mark_not_ready();
	manager.shutdown().await;
	let _ = sweeper.await;
	endpoint.close(0u32.into(), b"server shutting down");
	endpoint.wait_idle().await;
	info!("roomcast_server stopped");

	Ok(())
}
