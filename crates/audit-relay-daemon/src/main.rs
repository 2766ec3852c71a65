// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, future::Future, io, path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use audit_relay::{
    checkpoint::FileCheckpointStore,
    config::Config,
    poller::{resolve_start_checkpoint, Poller},
    sink::IngestSinkClient,
    source::DirectoryEventsClient,
};

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_CHECKPOINT_PATH: &str = "last_time.txt";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("AUDIT_RELAY_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,reqwest=off,{log_level}");

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Invalid AUDIT_RELAY_LOG_LEVEL '{log_level}': {e}, using info");
            EnvFilter::new("info")
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }
    debug!("Logging subsystem enabled");

    let config_path: PathBuf = env::var("AUDIT_RELAY_CONFIG")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
        .into();
    let checkpoint_path: PathBuf = env::var("AUDIT_RELAY_CHECKPOINT_FILE")
        .unwrap_or_else(|_| DEFAULT_CHECKPOINT_PATH.to_string())
        .into();

    let config = match Config::load(&config_path) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("CONFIG | {e}. Not starting the relay.");
            return;
        }
    };

    let source = match DirectoryEventsClient::new(Arc::clone(&config)) {
        Ok(source) => Arc::new(source),
        Err(e) => {
            error!("SOURCE | Unable to create events client: {e}. Not starting the relay.");
            return;
        }
    };
    let sink = Arc::new(IngestSinkClient::new(Arc::clone(&config)));
    let store = Arc::new(FileCheckpointStore::new(checkpoint_path));
    let start = resolve_start_checkpoint(&*store, config.start_checkpoint);

    let cancel = CancellationToken::new();
    tokio::spawn(wait_for_shutdown(cancel.clone()));

    let mut poller = Poller::new(source, sink, store, start, config.poll_interval());
    poller.run(cancel).await;
    info!("Relay stopped");
}

async fn wait_for_shutdown(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        match sigterm.recv().await {
            Some(()) => Ok(()),
            None => Err(io::Error::other("SIGTERM stream closed")),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<io::Result<()>>();

    shutdown_on_signal(cancel, tokio::signal::ctrl_c(), terminate).await;
}

/// Cancels `cancel` once either signal arrives. A signal whose listener
/// fails is logged and never fires.
async fn shutdown_on_signal<I, T>(cancel: CancellationToken, interrupt: I, terminate: T)
where
    I: Future<Output = io::Result<()>>,
    T: Future<Output = io::Result<()>>,
{
    tokio::select! {
        () = received(interrupt, "interrupts") => {}
        () = received(terminate, "SIGTERM") => {}
    }
    info!("Interrupt received, shutting down");
    cancel.cancel();
}

async fn received(signal: impl Future<Output = io::Result<()>>, name: &str) {
    if let Err(e) = signal.await {
        error!("Unable to listen for {name}: {e}");
        std::future::pending::<()>().await;
    }
}
