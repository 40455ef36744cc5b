#![forbid(unsafe_code)]

pub mod access;
pub mod auth;
pub mod connection;
pub mod error;
pub mod health;
pub mod history;
pub mod lifecycle;
pub mod membership;
pub mod registry;
pub mod sequencer;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod health_tests;


#[cfg(test)]
mod lifecycle_tests;


#[cfg(test)]
mod quic_session_tests;
