// signal: runs the signaling broker on its own.

use clap::{Arg, Command};
use kh_broker::{signaling_router, Broker, SignalingState};
use signal::config::{load_config, SignalConfig};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    let matches = Command::new("signal")
        .about("Standalone signaling broker")
        .arg(
            Arg::new("config")
                .help("Config file path")
                .short('c')
                .long("config"),
        )
        .arg(
            Arg::new("loglevel")
                .help("Log level (trace debug info warn error)")
                .long("loglevel"),
        )
        .arg(Arg::new("addr").help("Listen address").long("addr"))
        .get_matches();

    let mut cfg = match matches.get_one::<String>("config") {
        Some(path) => match load_config(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => SignalConfig::default(),
    };

    if let Some(v) = matches.get_one::<String>("loglevel") {
        cfg.loglevel = v.clone();
    }
    if let Some(v) = matches.get_one::<String>("addr") {
        cfg.addr = v.clone();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.loglevel.clone())),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "signal starting");

    let broker = Arc::new(Broker::default());
    let router = signaling_router(SignalingState {
        broker: Arc::clone(&broker),
    });

    let listener = tokio::net::TcpListener::bind(&cfg.addr)
        .await
        .expect("failed to bind");
    info!(addr = %cfg.addr, "signaling listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(broker))
    .await
    .expect("signal error");
    info!("signal shut down gracefully");
}

/// First SIGINT/SIGTERM/SIGQUIT drains the broker and shuts down
/// gracefully; a second signal exits with code 1 immediately.
async fn shutdown_signal(broker: Arc<Broker>) {
    wait_for_signal().await;
    info!("received shutdown signal");
    broker.close();
    tokio::spawn(async {
        wait_for_signal().await;
        std::process::exit(1);
    });
}

async fn wait_for_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(unix)]
    let quit = async {
        signal::unix::signal(signal::unix::SignalKind::quit())
            .expect("failed to install SIGQUIT handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    #[cfg(not(unix))]
    let quit = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = quit => {},
    }
}
