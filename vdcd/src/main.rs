//! vdcd: the VDC control-plane daemon.
//!
//! Serves the HTTP API and the console WebSocket endpoint, runs the
//! reconciler, migration coordinators, host heartbeats and the sweeper.
//! All configuration comes from the environment; see `config.rs`.

use std::process::ExitCode;

use anyhow::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod context;
mod hosts;
mod migrate;
mod reconcile;
mod sweep;
mod ws;

use config::Config;
use reconcile::ReconcileQueue;

enum RunError {
    Config(Error),
    Store(Error),
    Internal(Error),
}

impl RunError {
    fn exit_code(&self) -> u8 {
        match self {
            RunError::Config(_) => 3,
            RunError::Store(_) => 4,
            RunError::Internal(_) => 64,
        }
    }

    fn error(&self) -> &Error {
        match self {
            RunError::Config(err) | RunError::Store(err) | RunError::Internal(err) => err,
        }
    }
}

fn main() -> ExitCode {
    let mut args = std::env::args().skip(1);
    if let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("usage: vdcd");
                println!();
                println!("configuration environment: STORE_PATH HOSTS_CONFIG API_LISTEN");
                println!("  WS_LISTEN PUBLIC_IP_POOL DEFAULT_VPC_CIDR RECONCILE_WORKERS");
                println!("  HOST_VERB_CONCURRENCY SSH_IDENTITY VDC_LOG");
                return ExitCode::SUCCESS;
            }
            other => {
                eprintln!("unknown argument '{other}', try --help");
                return ExitCode::from(2);
            }
        }
    }

    let filter = EnvFilter::try_from_env("VDC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!("configuration error: {err:#}");
            return ExitCode::from(3);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("unable to start async runtime: {err}");
            return ExitCode::from(64);
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("{:#}", err.error());
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(config: Config) -> Result<(), RunError> {
    std::fs::create_dir_all(&config.ssh_control_dir)
        .map_err(|err| RunError::Config(Error::from(err).context("ssh control directory")))?;

    let store = vdc_store::Store::open(&config.store_path).map_err(RunError::Store)?;

    let (queue, queue_rx) = ReconcileQueue::new();
    context::init(context::AppState::new(config, store, queue));
    let state = context::state();

    hosts::register_from_config(state).map_err(RunError::Config)?;

    vdc_rest_server::catch_shutdown_signals().map_err(RunError::Internal)?;
    vdc_rest_server::check_workers_on_shutdown();

    let workers = state.config.reconcile_workers;
    tokio::spawn(reconcile::run_dispatcher(state, queue_rx, workers));
    tokio::spawn(reconcile::watch_vm_changes(state));
    tokio::spawn(hosts::heartbeat_loop(state));
    tokio::spawn(sweep::sweeper_loop(state));

    // resume interrupted work from Store state
    reconcile::enqueue_all(state).map_err(RunError::Internal)?;
    migrate::resume_all(state).map_err(RunError::Internal)?;

    let api_listener = tokio::net::TcpListener::bind(&state.config.api_listen)
        .await
        .map_err(|err| {
            RunError::Config(
                Error::from(err).context(format!("unable to bind {}", state.config.api_listen)),
            )
        })?;
    let ws_listener = tokio::net::TcpListener::bind(&state.config.ws_listen)
        .await
        .map_err(|err| {
            RunError::Config(
                Error::from(err).context(format!("unable to bind {}", state.config.ws_listen)),
            )
        })?;

    info!(
        api = %state.config.api_listen,
        ws = %state.config.ws_listen,
        "vdcd is up"
    );

    let api_server = tokio::spawn(vdc_rest_server::serve(api_listener, &api::ROOT_ROUTER));
    let ws_server = tokio::spawn(vdc_rest_server::serve(ws_listener, &ws::ROOT_ROUTER));

    let (api_result, ws_result) = tokio::join!(api_server, ws_server);
    for result in [api_result, ws_result] {
        match result {
            Ok(Ok(())) => (),
            Ok(Err(err)) => return Err(RunError::Internal(err)),
            Err(err) => return Err(RunError::Internal(err.into())),
        }
    }

    // listeners only stop on a shutdown request; drain the workers
    vdc_rest_server::last_worker_future().await;
    Ok(())
}
