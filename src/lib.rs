//! Building block of a modular proxy runtime
//!
//! Architecture:
//! - `listener/`: protocol-specific connection acceptors and the decorator
//!   chain for cross-cutting accept behavior (metrics, admission, rate
//!   limiting, PROXY protocol, TLS)
//! - `handler/`: per-connection traffic processors
//! - `core/`: collaborator hook traits, the bidirectional relay and the
//!   per-session record
//! - `transport/`: the uniform byte-stream abstraction, including the
//!   HTTP/2 exchange adapter
//! - `registry`: string key to constructor mapping for the composition root
//! - `service`: the generic accept loop binding a listener to a handler

pub mod config;
pub mod core;
pub mod error;
pub mod handler;
pub mod listener;
pub mod logger;
pub mod registry;
pub mod service;
pub mod tls;
pub mod transport;

pub use error::{ProxyError, Result};
