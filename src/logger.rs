use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise the level from the CLI applies
/// to this crate only.
pub fn init_logger(level: &str) {
    let filter = if let Ok(env_filter) = EnvFilter::try_from_default_env() {
        env_filter
    } else {
        EnvFilter::new(format!("relayd={}", level))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_thread_names(false)
                .with_file(false)
                .with_line_number(true)
                .with_ansi(true)
                .compact(),
        )
        .init();
}

pub mod log {
    pub use tracing::{debug, error, info, trace, warn};

    /// Connection lifecycle event
    pub fn connection(addr: &str, event: &str) {
        info!(peer = addr, event = event, "Connection");
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_filter_directive_shape() {
        // The default directive must target this crate, not the whole tree
        let directive = format!("relayd={}", "debug");
        assert_eq!(directive, "relayd=debug");
    }
}
