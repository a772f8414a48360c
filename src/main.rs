#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Dignode entrypoint (systemd-friendly).
//! Starts the node and runs until SIGINT/SIGTERM.

use dignode::core::config::NodeConfig;
use dignode::node::Node;
use tracing::{error, info};

fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("DIG_LOG_JSON").map(|v| v == "1").unwrap_or(false);
    if json {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init();
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    // Optional config file: first argument, else DIG_CONFIG.
    let config_path = std::env::args().nth(1).or_else(|| std::env::var("DIG_CONFIG").ok());
    let config = match NodeConfig::load(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(2);
        }
    };

    info!(
        home = %config.dig_home.display(),
        port = config.port,
        network = %config.network_id,
        "dignode starting"
    );

    let node = match Node::start(config).await {
        Ok(node) => node,
        Err(e) => {
            error!(err = %e, "startup failed");
            std::process::exit(1);
        }
    };

    wait_for_signal().await;
    node.shutdown().await;
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = term.recv() => info!("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
