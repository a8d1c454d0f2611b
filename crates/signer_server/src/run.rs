// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::path::Path;
use std::pin::pin;
use std::sync::Arc;

use anyhow::Context;
use futures::{Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use signer::{SoftCertificateDecoder, SoftDeviceProvider, TokenManager};

use crate::config::Config;
use crate::metrics::SignerMetrics;
use crate::opts::Opts;
use crate::rpc;
use crate::server::{tcp_connections, Server};
use crate::signal::{Request, Signals};
use crate::state::SignerState;

const MONITORING_MAX_CONNECTIONS: usize = 16;

/// Runs the signer until it's told to stop.
///
/// * `SIGHUP` rereads the config and reconciles the token set with it.
/// * The first `SIGINT` stops accepting connections and waits for open ones to finish.
/// * `SIGTERM`, or another `SIGINT`, stops right away.
///
/// Either way, every token worker is drained and closed before this returns.
///
/// **BEWARE:** This permanently registers signal handlers through [`tokio`].
pub async fn run(opts: Opts) -> anyhow::Result<()> {
    let signals = Signals::register().context("registering signal handlers")?;

    let (mut config, hash) = Config::load(&opts.cfg_path).await?;
    if let Some(address) = opts.address {
        config.address = address;
    }
    if let Some(address) = opts.monitoring_address {
        config.monitoring_address = Some(address);
    }
    info!("Loaded config {hash}");

    let metrics = Arc::new(SignerMetrics::new().context("registering metrics")?);
    metrics
        .max_connections
        .set(i64::try_from(config.max_connections).unwrap_or(i64::MAX));

    let manager = Arc::new(TokenManager::new(
        Arc::new(SoftDeviceProvider),
        Arc::new(SoftCertificateDecoder),
    ));
    manager
        .start(config.token_specs().await)
        .await
        .context("starting tokens")?;

    let state = Arc::new(SignerState::new(
        manager.clone(),
        metrics,
        config.json_size_limit,
    ));
    state.swap_config_hash(hash);

    let main_listener = TcpListener::bind(config.address)
        .await
        .with_context(|| format!("binding main plane to {}", config.address))?;
    info!("Main plane listening on {}", config.address);
    let monitoring_listener = match config.monitoring_address {
        Some(address) => {
            let listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("binding monitoring plane to {address}"))?;
            info!("Monitoring plane listening on {address}");
            Some(listener)
        }
        None => None,
    };

    let main_server = Server::new(config.max_connections);
    let monitoring_server = Server::new(MONITORING_MAX_CONNECTIONS);

    let serve_main = main_server.serve(tcp_connections(main_listener), {
        let state = state.clone();
        move |request, _| rpc::respond(state.clone(), request)
    });
    let serve_monitoring = async {
        if let Some(listener) = monitoring_listener {
            let state = state.clone();
            monitoring_server
                .serve(tcp_connections(listener), move |request, _| {
                    rpc::respond_to_monitoring_plane(state.clone(), request)
                })
                .await;
        }
    };

    // Reloads run beside the signal loop, one at a time, so a shutdown request never waits
    // behind a slow reconfigure.
    let (reload_requests, mut reloads) = mpsc::channel(1);
    let reloader = async {
        while reloads.recv().await.is_some() {
            reload(&opts.cfg_path, &state).await;
        }
    };

    let mut signals = pin!(signals.into_stream());
    let control = async {
        if wait_for_shutdown(signals.as_mut(), &reload_requests).await == Shutdown::Fast {
            info!("Fast shutdown requested...");
            return;
        }

        info!("Graceful shutdown signaled");
        let drained = async {
            tokio::join!(
                main_server.graceful_shutdown(),
                monitoring_server.graceful_shutdown()
            )
        };
        tokio::select! {
            _ = drained => {}
            _ = wait_for_shutdown(signals.as_mut(), &reload_requests) => {
                info!("Fast shutdown requested...");
            }
        }
    };

    tokio::select! {
        () = control => {}
        () = reloader => {}
        _ = async { tokio::join!(serve_main, serve_monitoring) } => {}
    }

    manager.shutdown().await;
    info!("All tokens closed");
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shutdown {
    Graceful,
    Fast,
}

/// Handles signals until one asks for a shutdown. Reload requests are handed to
/// `reload_requests`; if one is already waiting there, the new one is folded into it.
async fn wait_for_shutdown(
    mut signals: impl Stream<Item = Request> + Unpin,
    reload_requests: &mpsc::Sender<()>,
) -> Shutdown {
    while let Some(request) = signals.next().await {
        match request {
            Request::Reload => {
                info!("Config reload signaled");
                if reload_requests.try_send(()).is_err() {
                    info!("A config reload is already pending");
                }
            }
            Request::GracefulShutdown => return Shutdown::Graceful,
            Request::FastShutdown => return Shutdown::Fast,
        }
    }
    Shutdown::Fast
}

/// Rereads the config and brings the token set in line with it. Listen addresses and the
/// body size limit stay as they were at startup.
async fn reload(cfg_path: &Path, state: &SignerState) {
    let (config, hash) = match Config::load(cfg_path).await {
        Ok(loaded) => loaded,
        Err(err) => {
            error!("Unable to reload config: {err:?}");
            return;
        }
    };
    if !state.swap_config_hash(hash) {
        info!("Config {hash} is unchanged; nothing to reload");
        return;
    }
    state.manager().reconfigure(config.token_specs().await).await;
    info!("Reloaded config {hash}");
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::stream;

    #[tokio::test]
    async fn shutdown_is_not_held_up_by_pending_reloads() {
        // Nothing drains the queue, as if a reload were stuck.
        let (reload_requests, mut reloads) = mpsc::channel(1);
        let signals = stream::iter([
            Request::Reload,
            Request::Reload,
            Request::Reload,
            Request::FastShutdown,
        ]);

        let shutdown = wait_for_shutdown(signals, &reload_requests).await;
        assert_eq!(shutdown, Shutdown::Fast);
        assert_eq!(reloads.try_recv(), Ok(()));
        assert!(reloads.try_recv().is_err());
    }

    #[tokio::test]
    async fn first_interrupt_is_graceful() {
        let (reload_requests, mut reloads) = mpsc::channel(1);
        let signals = stream::iter([Request::GracefulShutdown, Request::Reload]);

        let shutdown = wait_for_shutdown(signals, &reload_requests).await;
        assert_eq!(shutdown, Shutdown::Graceful);
        assert!(reloads.try_recv().is_err());
    }

    #[tokio::test]
    async fn ended_signal_stream_means_fast_shutdown() {
        let (reload_requests, _reloads) = mpsc::channel(1);
        let shutdown = wait_for_shutdown(stream::empty(), &reload_requests).await;
        assert_eq!(shutdown, Shutdown::Fast);
    }
}
