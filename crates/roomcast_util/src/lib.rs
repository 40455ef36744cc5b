#![forbid(unsafe_code)]

pub mod endpoint;

pub use endpoint::{DEFAULT_ENDPOINT, EndpointError, QuicEndpoint};
