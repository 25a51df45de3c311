//! Service: the generic accept loop
//!
//! Binds one listener to one handler: every accepted connection gets its own
//! task and a fresh session id. A failing session never stops the loop; the
//! loop ends only on the listener's terminal error.

use crate::core::session::SessionContext;
use crate::error::{ProxyError, Result};
use crate::handler::Handler;
use crate::listener::Listener;
use crate::logger::log;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct Service {
    name: String,
    listener: Box<dyn Listener>,
    handler: Arc<dyn Handler>,
    next_sid: AtomicU64,
}

impl Service {
    pub fn new(name: &str, listener: Box<dyn Listener>, handler: Arc<dyn Handler>) -> Self {
        Self {
            name: name.to_string(),
            listener,
            handler,
            next_sid: AtomicU64::new(1),
        }
    }

    /// Run until the listener reports its terminal state. Sessions already
    /// dispatched keep running after this returns.
    pub async fn serve(&self) -> Result<()> {
        log::info!(
            service = %self.name,
            addr = ?self.listener.local_addr(),
            "service started"
        );
        loop {
            match self.listener.accept().await {
                Ok(accepted) => {
                    let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        let ctx = SessionContext { sid };
                        if let Err(e) = handler.handle(ctx, accepted.stream, accepted.meta).await {
                            log::debug!(sid, error = %e, "session ended with error");
                        }
                    });
                }
                Err(ProxyError::Closed) => {
                    log::info!(service = %self.name, "service closed");
                    return Ok(());
                }
                Err(e) => {
                    log::error!(service = %self.name, error = %e, "service stopped");
                    return Err(e);
                }
            }
        }
    }

    /// Close the underlying listener. Idempotent.
    pub async fn close(&self) {
        self.listener.close().await;
    }
}
