use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tally_common::crypto::generate_key_pair;
use tally_common::proto::metric_service_server::MetricServiceServer;
use tally_storage::{MetricStore, Storage};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tonic::transport::Server as TonicServer;
use tracing_subscriber::EnvFilter;

use tally_server::app;
use tally_server::config::ServerConfig;
use tally_server::grpc;
use tally_server::shutdown::{drain, shutdown_signal, stopped, Listener};
use tally_server::state::AppState;

const KEY_BITS: usize = 2048;

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  tally-server [config.toml]        Start the server (default config/server.toml)");
    eprintln!("  tally-server keygen <dir>         Write private.pem and public.pem into <dir>");
}

fn init_tracing(debug: bool) -> Result<()> {
    let directive = if debug { "tally=debug" } else { "tally=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("keygen") => {
            let dir = args.get(2).ok_or_else(|| {
                print_usage();
                anyhow::anyhow!("Missing output directory")
            })?;
            init_tracing(false)?;
            run_keygen(Path::new(dir))
        }
        Some("-h") | Some("--help") => {
            print_usage();
            Ok(())
        }
        other => {
            let config_path = other.unwrap_or("config/server.toml");
            let config = ServerConfig::load(config_path)
                .with_context(|| format!("failed to load {config_path}"))?;
            init_tracing(config.debug)?;
            run_server(config).await
        }
    }
}

fn run_keygen(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let (public_pem, private_pem) = generate_key_pair(KEY_BITS)?;
    let private_path = dir.join("private.pem");
    let public_path = dir.join("public.pem");
    std::fs::write(&private_path, private_pem)?;
    std::fs::write(&public_path, public_pem)?;
    tracing::info!(
        private = %private_path.display(),
        public = %public_path.display(),
        bits = KEY_BITS,
        "Key pair written"
    );
    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<()> {
    tracing::info!(
        http = %config.http_addr,
        grpc = ?config.grpc_addr(),
        durable = config.store.database_dsn.is_some(),
        "tally-server starting"
    );

    let store = Arc::new(Storage::open(&config.store)?);
    if config.store.restore {
        match store.restore_from_durable() {
            Ok(count) => tracing::info!(count, "Metric table restored"),
            Err(e) => tracing::warn!(error = %e, "Restore failed, starting with an empty table"),
        }
    }

    let flush_handle = store.flush_interval(&config.store).map(|period| {
        let store = Arc::clone(&store);
        tokio::spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tick.tick().await;
            loop {
                tick.tick().await;
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.flush()).await {
                    Ok(Ok(())) => tracing::debug!("Snapshot written"),
                    Ok(Err(e)) => tracing::error!(error = %e, "Snapshot write failed"),
                    Err(e) => tracing::error!(error = %e, "Snapshot task failed"),
                }
            }
        })
    });

    let grace = config.shutdown_grace();
    let grpc_addr = config
        .grpc_addr()
        .map(|a| a.parse::<SocketAddr>())
        .transpose()
        .context("invalid grpc_addr")?;
    let http_addr: SocketAddr = config.http_addr.parse().context("invalid http_addr")?;

    let state = AppState::new(config, Arc::clone(&store))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut listeners = Vec::with_capacity(2);

    // HTTP server
    let app = app::build_http_app(state.clone());
    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    let rx = shutdown_rx.clone();
    listeners.push(Listener::spawn("http", async move {
        axum::serve(
            http_listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(stopped(rx))
        .await?;
        Ok::<(), anyhow::Error>(())
    }));

    // gRPC server
    if let Some(addr) = grpc_addr {
        let service = MetricServiceServer::new(grpc::MetricServiceImpl::new(state));
        let rx = shutdown_rx.clone();
        listeners.push(Listener::spawn("grpc", async move {
            TonicServer::builder()
                .add_service(service)
                .serve_with_shutdown(addr, stopped(rx))
                .await?;
            Ok::<(), anyhow::Error>(())
        }));
    }

    tracing::info!(http = %http_addr, grpc = ?grpc_addr, "Server started");

    tokio::select! {
        _ = listeners[0].join() => {
            tracing::warn!("HTTP listener exited, shutting down");
        }
        _ = shutdown_signal() => {
            tracing::info!("Shutting down gracefully");
        }
    }
    if shutdown_tx.send(true).is_err() {
        tracing::debug!("Every listener had already stopped");
    }

    drain(&mut listeners, grace).await;

    if let Some(handle) = flush_handle {
        handle.abort();
    }
    let closing = Arc::clone(&store);
    match tokio::task::spawn_blocking(move || closing.close()).await {
        Ok(Ok(())) => tracing::info!("Store closed"),
        Ok(Err(e)) => tracing::error!(error = %e, "Final flush failed"),
        Err(e) => tracing::error!(error = %e, "Store close task failed"),
    }

    tracing::info!("Server stopped");
    Ok(())
}
