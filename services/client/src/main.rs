// client: runs the reconciler and one negotiation session per subscription.

use clap::{Arg, ArgAction, Command};
use client::config::{load_config, ClientConfig};
use client::manager::Manager;
use client::plugin::load_plugins;
use client::reconciler::{Reconciler, ReconcilerConfig, DEFAULT_TICK, PUNCH_DELAY};
use client::registry::RegistryClient;
use client::session::{Session, SessionConfig};
use client::signal::SignalingClient;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() {
    let matches = Command::new("client")
        .about("Reconciler and per-peer negotiation sessions")
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
        .arg(Arg::new("hostname").help("Identity and receive topic").long("hostname"))
        .arg(
            Arg::new("endpoint-port")
                .help("Port advertised with local addresses")
                .long("endpoint-port")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("server")
                .help("Host registry base URL")
                .long("server"),
        )
        .arg(
            Arg::new("signal-server")
                .help("Signaling broker base URL")
                .long("signal-server"),
        )
        .arg(
            Arg::new("stun-server")
                .help("STUN server URI, repeatable; probed in order")
                .long("stun-server")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("subscriptions")
                .help("Peer hostname to negotiate with, repeatable")
                .short('s')
                .long("subscriptions")
                .action(ArgAction::Append),
        )
        .get_matches();

    let mut cfg = match matches.get_one::<String>("config") {
        Some(path) => match load_config(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("FATAL: failed to load config: {}", e);
                std::process::exit(1);
            }
        },
        None => ClientConfig::default(),
    };

    // Flags override file values.
    if let Some(v) = matches.get_one::<String>("loglevel") {
        cfg.loglevel = v.clone();
    }
    if let Some(v) = matches.get_one::<String>("hostname") {
        cfg.hostname = v.clone();
    }
    if let Some(v) = matches.get_one::<u16>("endpoint-port") {
        cfg.endpoint_port = *v;
    }
    if let Some(v) = matches.get_one::<String>("server") {
        cfg.server = v.clone();
    }
    if let Some(v) = matches.get_one::<String>("signal-server") {
        cfg.signal_server = v.clone();
    }
    if let Some(values) = matches.get_many::<String>("stun-server") {
        cfg.stun_server = values.cloned().collect();
    }
    if let Some(values) = matches.get_many::<String>("subscriptions") {
        cfg.subscriptions = values
            .cloned()
            .map(|topic| client::config::Subscription { topic })
            .collect();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.loglevel.clone())),
        )
        .init();

    if let Err(e) = cfg.validate() {
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %cfg.hostname,
        subscriptions = cfg.subscriptions.len(),
        "client starting"
    );

    let plugins = match load_plugins(&cfg.plugins) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    let registry = Arc::new(RegistryClient::new(&cfg.server));
    // Host notifications arrive on the registry's embedded broker; session
    // traffic uses the signaling broker.
    let notifications = Arc::new(SignalingClient::new(&cfg.server, &cfg.hostname));

    let mut manager = Manager::new();

    if !cfg.subscriptions.is_empty() {
        let signaling = Arc::new(SignalingClient::new(&cfg.signal_server, &cfg.hostname));
        for sub in &cfg.subscriptions {
            let mut session_cfg = SessionConfig::new(cfg.hostname.clone(), sub.topic.clone());
            session_cfg.agent.stun_servers = cfg.stun_server.clone();
            let session = Session::new(session_cfg, Arc::clone(&signaling));
            info!(
                target = %sub.topic,
                controlling = session.is_controlling(),
                "starting session"
            );
            manager.spawn(
                &format!("session:{}", sub.topic),
                session.run(manager.shutdown_signal()),
            );
        }
    }

    let reconciler = Reconciler::new(
        ReconcilerConfig {
            hostname: cfg.hostname.clone(),
            endpoint_port: cfg.endpoint_port,
            stun_servers: cfg.stun_server.clone(),
            subscriptions: cfg.subscriptions.iter().map(|s| s.topic.clone()).collect(),
            tick: DEFAULT_TICK,
            punch_delay: PUNCH_DELAY,
        },
        registry,
        notifications,
        plugins,
    );
    manager.spawn("reconciler", reconciler.run(manager.shutdown_signal()));

    wait_for_signal().await;
    info!("received shutdown signal");
    manager.stop();
    tokio::spawn(async {
        wait_for_signal().await;
        std::process::exit(1);
    });
    manager.wait().await;
    info!("client shut down gracefully");
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
