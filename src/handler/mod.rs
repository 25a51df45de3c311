//! Handler layer
//!
//! A handler owns one accepted connection for the lifetime of its session.
//! Handlers never see the listener that produced the connection; everything
//! they need arrives through the stream, its metadata and the injected
//! capabilities.

pub mod redirect;

pub use redirect::RedirectHandler;

use crate::config::Metadata;
use crate::core::hooks::{BypassPolicy, RateLimiterRegistry, Recorder, Router};
use crate::core::session::SessionContext;
use crate::error::Result;
use crate::transport::{ConnectionMeta, TransportStream};
use async_trait::async_trait;
use std::sync::Arc;

/// Per-connection traffic processor.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn init(&mut self, md: Metadata) -> Result<()>;

    /// Process one connection to completion. Errors are scoped to this
    /// connection and never affect the listener or other sessions.
    async fn handle(
        &self,
        ctx: SessionContext,
        stream: TransportStream,
        meta: ConnectionMeta,
    ) -> Result<()>;
}

/// Capabilities and settings injected into a handler at construction
pub struct HandlerOptions {
    /// Service name used in logs and records
    pub service: String,
    /// Outbound dialer
    pub router: Arc<dyn Router>,
    /// Destinations that must not be proxied; pass-through when unset
    pub bypass: Option<Arc<dyn BypassPolicy>>,
    /// Per-host rate limiting; pass-through when unset
    pub rate_limiter: Option<Arc<dyn RateLimiterRegistry>>,
    /// Session record sink; records are dropped when unset
    pub recorder: Option<Arc<dyn Recorder>>,
}
