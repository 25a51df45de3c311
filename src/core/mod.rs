//! Core proxy building blocks
//!
//! - Hook traits for the external collaborators (router, policies, recorder)
//! - Bidirectional relay
//! - Per-session record with guaranteed exactly-once flush

pub mod hooks;
pub mod relay;
pub mod session;

pub use hooks::{
    AdmissionPolicy, BypassPolicy, DirectRouter, ListenerMetrics, RateLimiter,
    RateLimiterRegistry, Recorder, Router,
};
pub use relay::{copy_duplex, CopyResult};
pub use session::{SessionContext, SessionGuard, SessionRecord};
