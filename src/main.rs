use std::net::SocketAddr;

use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use harbormaster::cli::{Cli, Commands};
use harbormaster::config::Config;
use harbormaster::handlers;
use harbormaster::heartbeat::HeartbeatSupervisor;
use harbormaster::session::CloseReason;
use harbormaster::ws::HubState;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_ascii_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    if let Some(Commands::Debug { url, command }) = cli.command {
        if let Err(err) = harbormaster::cli::run_debug_client(url, command).await {
            error!("debug client error: {err:#}");
            std::process::exit(1);
        }
        return;
    }

    info!(
        port = config.port,
        ping_interval_secs = config.ping_interval.as_secs(),
        connection_timeout_secs = config.connection_timeout.as_secs(),
        telemetry_buffer_size = config.telemetry_buffer_size,
        "starting harbormaster relay hub"
    );

    let prometheus = install_metrics_recorder();
    let state = HubState::new(config.clone());

    let supervisor = HeartbeatSupervisor::new(
        state.registry.clone(),
        config.ping_interval,
        config.connection_timeout,
    );
    let heartbeat = tokio::spawn(supervisor.run());
    let sweeper = tokio::spawn(state.registry.clone().run_sweeper());

    let app = handlers::app(state.clone(), Some(prometheus));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listener");
    info!("harbormaster listening on {addr}");

    // Closing every session lets the write flows drain and the connections
    // finish, which is what graceful shutdown waits on.
    let shutdown_state = state.clone();
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(
            open_sessions = shutdown_state.registry.session_count(),
            "shutdown signal received"
        );
        shutdown_state
            .registry
            .close_all(CloseReason::ShuttingDown);
    };

    let service = app.into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("server error");

    heartbeat.abort();
    sweeper.abort();
    info!("shutdown complete");
}

fn install_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
