#![forbid(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

/// Where the server listens and the client connects when nothing else is configured.
pub const DEFAULT_ENDPOINT: &str = "quic://127.0.0.1:18303";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
	#[error("endpoint must be non-empty (expected quic://host:port)")]
	Empty,
	#[error("invalid endpoint scheme (expected quic://host:port): {0}")]
	Scheme(String),
	#[error("endpoint must not carry a path, query or fragment: {0}")]
	Trailing(String),
	#[error("invalid endpoint host: {0}")]
	Host(String),
	#[error("invalid endpoint port (expected 1..=65535): {0}")]
	Port(String),
	#[error("host must be an IP literal: {0}")]
	NotIpLiteral(String),
}

/// Parsed `quic://host:port` endpoint. IPv6 hosts keep their brackets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuicEndpoint {
	pub host: String,
	pub port: u16,
}

impl QuicEndpoint {
	pub fn parse(s: &str) -> Result<Self, EndpointError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(EndpointError::Empty);
		}

		let rest = s
			.strip_prefix("quic://")
			.ok_or_else(|| EndpointError::Scheme(s.to_string()))?;

		if rest.contains(['/', '?', '#']) {
			return Err(EndpointError::Trailing(s.to_string()));
		}

		let (host, port) = rest
			.rsplit_once(':')
			.ok_or_else(|| EndpointError::Port(s.to_string()))?;

		let host = host.trim();
		if host.is_empty() {
			return Err(EndpointError::Host(s.to_string()));
		}
		if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
			return Err(EndpointError::Host(format!("IPv6 must be bracketed like quic://[::1]:18303: {s}")));
		}

		let port = match port.trim().parse::<u16>() {
			Ok(p) if p != 0 => p,
			_ => return Err(EndpointError::Port(s.to_string())),
		};

		Ok(Self {
			host: host.to_string(),
			port,
		})
	}

	/// `host:port`, suitable for DNS resolution.
	pub fn hostport(&self) -> String {
		format!("{}:{}", self.host, self.port)
	}

	/// Host without IPv6 brackets, used as the TLS server name.
	pub fn server_name(&self) -> &str {
		self.host.trim_start_matches('[').trim_end_matches(']')
	}

	/// Socket address when the host is an IP literal. Binding never resolves names.
	pub fn socket_addr(&self) -> Result<SocketAddr, EndpointError> {
		self.hostport()
			.parse()
			.map_err(|_| EndpointError::NotIpLiteral(self.host.clone()))
	}
}

impl fmt::Display for QuicEndpoint {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "quic://{}:{}", self.host, self.port)
	}
}

impl FromStr for QuicEndpoint {
	type Err = EndpointError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}
