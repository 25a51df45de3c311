//! relayd — modular proxy runtime
//!
//! Composition root: parses the CLI, registers the built-in listener and
//! handler types, wires the injected capabilities and runs the service
//! until a shutdown signal arrives.

use relayd::config::{self, Metadata, MD_BACKLOG};
use relayd::core::hooks::{DirectRouter, LogRecorder};
use relayd::handler::HandlerOptions;
use relayd::listener::{ListenerOptions, ProxyProtocolConfig};
use relayd::logger::{self, log};
use relayd::registry::Registry;
use relayd::service::Service;
use relayd::tls;

use anyhow::{anyhow, Result};
use std::sync::Arc;

// Use mimalloc as the global allocator for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    // Install ring as the default crypto provider for rustls.
    // This must be done before any TLS operations.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = config::CliArgs::parse_args();
    cli.validate().map_err(|e| anyhow!(e))?;

    logger::init_logger(&cli.log_level);

    log::info!(
        addr = %cli.addr,
        listener = %cli.listener,
        handler = %cli.handler,
        "Starting relayd"
    );

    let registry = Registry::with_defaults();

    let tls_acceptor = match (&cli.cert_file, &cli.key_file) {
        (Some(cert), Some(key)) => {
            let tls_config = tls::load_tls_config(cert, key)?;
            Some(tokio_rustls::TlsAcceptor::from(tls_config))
        }
        _ => None,
    };

    let listener_ctor = registry
        .listener(&cli.listener)
        .ok_or_else(|| anyhow!("unknown listener type: {}", cli.listener))?;
    let mut listener = listener_ctor(ListenerOptions {
        service: cli.service.clone(),
        addr: cli.addr.clone(),
        tls: tls_acceptor,
        tls_handshake_timeout: cli.tls_handshake_timeout,
        admission: None,
        rate_limiter: None,
        metrics: None,
        proxy_protocol: cli.proxy_protocol.then(|| ProxyProtocolConfig {
            header_timeout: cli.proxy_header_timeout,
        }),
        tcp_nodelay: cli.tcp_nodelay,
    });

    let mut md = Metadata::new();
    md.insert(MD_BACKLOG, cli.backlog as i64);
    listener.init(md).await?;

    let handler_ctor = registry
        .handler(&cli.handler)
        .ok_or_else(|| anyhow!("unknown handler type: {}", cli.handler))?;
    let mut handler = handler_ctor(HandlerOptions {
        service: cli.service.clone(),
        router: Arc::new(DirectRouter::new(cli.connect_timeout, cli.tcp_nodelay)),
        bypass: None,
        rate_limiter: None,
        recorder: Some(Arc::new(LogRecorder)),
    });
    handler.init(Metadata::new()).await?;

    let service = Arc::new(Service::new(&cli.service, listener, Arc::from(handler)));

    // Shutdown handler
    let service_for_shutdown = Arc::clone(&service);
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = signal(SignalKind::interrupt()).expect("Failed to setup SIGINT");
            let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM");

            tokio::select! {
                _ = sigint.recv() => {
                    log::info!("SIGINT received, shutting down...");
                }
                _ = sigterm.recv() => {
                    log::info!("SIGTERM received, shutting down...");
                }
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutdown signal received...");
        }

        service_for_shutdown.close().await;
    });

    service.serve().await?;
    Ok(())
}
