#![forbid(unsafe_code)]

use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use quinn::{Endpoint, ServerConfig};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};

/// QUIC listener settings.
pub struct QuicServerConfig {
	pub bind_addr: SocketAddr,
	pub alpn_protocols: Vec<Vec<u8>>,
	/// Control + events; a little slack for clients that reopen.
	pub max_concurrent_bidi_streams: u32,
	/// Transport-level idle timeout. The heartbeat timeout in the connection handler fires first.
	pub max_idle_timeout: Duration,
}

impl QuicServerConfig {
	pub fn new(bind_addr: SocketAddr, heartbeat_timeout: Duration) -> Self {
		Self {
			bind_addr,
			alpn_protocols: vec![roomcast_protocol::version::ALPN.to_vec()],
			max_concurrent_bidi_streams: 4,
			max_idle_timeout: heartbeat_timeout * 2,
		}
	}

	/// Bind with a freshly generated self-signed certificate; returns the certificate DER so
	/// local clients can pin it.
	pub fn bind_dev_endpoint(&self) -> anyhow::Result<(Endpoint, Vec<u8>)> {
		let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;
		let cert_der = ck.cert.der().to_vec();
		let key = PrivateKeyDer::try_from(ck.signing_key.serialize_der())
			.map_err(|e| anyhow!("parse private key der: {e}"))?;

		let server_config = self.server_config(vec![CertificateDer::from(cert_der.clone())], key)?;
		let endpoint = Endpoint::server(server_config, self.bind_addr).context("bind quinn endpoint")?;
		Ok((endpoint, cert_der))
	}

	/// Bind using PEM certificate chain and key files.
	pub fn bind_endpoint_with_tls(&self, cert_path: &Path, key_path: &Path) -> anyhow::Result<Endpoint> {
		let server_config = self.server_config(load_cert_chain(cert_path)?, load_private_key(key_path)?)?;
		Endpoint::server(server_config, self.bind_addr).context("bind quinn endpoint")
	}

	fn server_config(
		&self,
		cert_chain: Vec<CertificateDer<'static>>,
		key: PrivateKeyDer<'static>,
	) -> anyhow::Result<ServerConfig> {
		let mut tls_config = rustls::ServerConfig::builder()
			.with_no_client_auth()
			.with_single_cert(cert_chain, key)
			.context("build rustls server config")?;
		tls_config.alpn_protocols = self.alpn_protocols.clone();

		let quic_tls = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
			.context("convert rustls ServerConfig -> quinn QuicServerConfig")?;

		let mut transport = quinn::TransportConfig::default();
		transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(self.max_concurrent_bidi_streams));
		transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(0));
		transport.max_idle_timeout(Some(
			quinn::IdleTimeout::try_from(self.max_idle_timeout).context("quic idle timeout out of range")?,
		));

		let mut server_config = ServerConfig::with_crypto(Arc::new(quic_tls));
		server_config.transport_config(Arc::new(transport));
		Ok(server_config)
	}
}

fn load_cert_chain(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let pem = fs::read(path).with_context(|| format!("read tls cert: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	let chain = certs(&mut reader).collect::<Result<Vec<_>, _>>().context("parse tls certs")?;
	if chain.is_empty() {
		return Err(anyhow!("no certificates found in {}", path.display()));
	}
	Ok(chain)
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let pem = fs::read(path).with_context(|| format!("read tls key: {}", path.display()))?;
	let mut reader = BufReader::new(&pem[..]);
	private_key(&mut reader)
		.context("parse tls key")?
		.ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}
