#[macro_use]
extern crate tracing;

use clap::Parser;
use eyre::Result;
use externaldns_operator::{
    config::{
        Args,
        ControllerArgs,
    },
    controller::{
        Controller,
        ControllerError,
    },
    events::EventRecorder,
    resources,
    sync::ApplyDnsEndpoint,
    watch_group::watch_groups,
};
use kube::{
    runtime::watcher,
    CustomResourceExt as _,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Args::parse() {
        Args::Crds => {
            let yaml = serde_yaml::to_string(&resources::DNSEndpoint::crd())?;
            print!("{yaml}")
        }
        Args::Controller(args) => {
            run_controller(args).await?;
        }
    }

    Ok(())
}

async fn run_controller(args: ControllerArgs) -> Result<()> {
    let client = kube::Client::try_default().await?;

    let scope = args.scope();
    let groups = watch_groups(&client, &scope, &watcher::Config::default());
    info!(?scope, "created {} watch group(s)", groups.len());

    let recorder = EventRecorder::new(client.clone(), &args.controller_name);
    let sync = Arc::new(ApplyDnsEndpoint::new(client, recorder, &args.controller_name));
    let controller = Controller::new(groups, sync, args.controller_opts());

    let stop = CancellationToken::new();
    tokio::spawn(cancel_on_signal(stop.clone()));

    stopped(controller.run(stop).await)
}

/// A stop signal while waiting for the caches is a clean exit. Failing to sync them is fatal.
fn stopped(result: Result<(), ControllerError>) -> Result<()> {
    match result {
        Err(ControllerError::Cancelled) => {
            info!("stopped before the caches synced");
            Ok(())
        }
        result => Ok(result?),
    }
}

async fn cancel_on_signal(stop: CancellationToken) {
    let interrupt = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("unable to listen for SIGINT: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{
            signal,
            SignalKind,
        };
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("unable to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }

    info!("stop signal received, shutting down");
    stop.cancel();
}
