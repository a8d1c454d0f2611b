// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Serves HTTP/1.1 connections with a connection limit and graceful shutdown.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::{service_fn, HttpService};
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, info_span, warn, Instrument};

use crate::response::GenericResponse;

pub struct Server {
    concurrent_connections: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// `max_connections` is how many connections may be open at once, across all
    /// [`serve`](Self::serve) calls, before new ones are turned away with a 503.
    pub fn new(max_connections: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            concurrent_connections: Arc::new(Semaphore::new(max_connections)),
            shutdown,
        }
    }

    /// Serves each connection from `connections` in its own task, answering requests with
    /// `respond`.
    ///
    /// Resolves once [`graceful_shutdown`](Self::graceful_shutdown) has been called (or
    /// `connections` ends) and every connection it accepted has closed.
    pub async fn serve<P, C, R, F>(&self, connections: P, respond: R)
    where
        P: Stream<Item = std::io::Result<(C, SocketAddr)>>,
        C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        R: Fn(Request<Incoming>, SocketAddr) -> F + Clone + Send + Sync + 'static,
        F: Future<Output = GenericResponse> + Send + 'static,
    {
        // Subscribed first so graceful_shutdown can't return before this call does.
        let mut shutdown_receiver = self.shutdown.subscribe();
        let mut was_shutdown = pin!(shutdown_receiver.wait_for(|&done| done).map(|_| None));
        let mut tasks = JoinSet::new();
        let mut connections = pin!(connections);

        info!("Started serving");
        loop {
            let accepted = select! {
                biased;
                none = &mut was_shutdown => none,
                next = connections.next() => next,
            };
            let Some(accepted) = accepted else { break };
            let (connection, peer_addr) = match accepted {
                Ok(a) => a,
                Err(err) => {
                    error!("Couldn't accept connection: {err}");
                    continue;
                }
            };

            let Ok(permit) = self.concurrent_connections.clone().try_acquire_owned() else {
                warn!("Too overloaded to serve {peer_addr}; sending minimal 503.");
                tasks.spawn(respond_with_temporarily_unavailable(connection).map(|_| ()));
                continue;
            };

            let respond = respond.clone();
            let service = service_fn(move |request: Request<Incoming>| {
                info!("Request: {} {}", request.method(), request.uri());
                respond(request, peer_addr).map(|response| {
                    info!("Response: {}", response.status());
                    Ok::<_, Infallible>(response)
                })
            });
            let mut shutdown_receiver = self.shutdown.subscribe();
            let connection_task = async move {
                let _permit = permit;
                info!("Connected.");
                let wants_shutdown = shutdown_receiver.wait_for(|&done| done);
                let http_connection = http1::Builder::new()
                    .serve_connection(TokioIo::new(connection), service);
                if let Err(err) = with_graceful_shutdown(http_connection, wants_shutdown).await {
                    error!("Error serving: {err}");
                }
                info!("Disconnected.");
            };
            tasks.spawn(connection_task.instrument(info_span!("connection", addr = %peer_addr)));

            // Reap finished connections as we go.
            while let Some(Some(_)) = tasks.join_next().now_or_never() {}
        }

        drop(connections);
        while tasks.join_next().await.is_some() {}
        info!("Stopped serving");
    }

    /// Stops accepting connections, lets in-progress requests finish, and resolves once every
    /// [`serve`](Self::serve) call has returned.
    pub async fn graceful_shutdown(&self) {
        self.shutdown.send_replace(true);
        self.shutdown.closed().await;
    }
}

/// Turns a bound listener into the connection stream [`Server::serve`] expects.
pub fn tcp_connections(
    listener: TcpListener,
) -> impl Stream<Item = std::io::Result<(TcpStream, SocketAddr)>> {
    futures::stream::unfold(listener, |listener| async move {
        let accepted = listener.accept().await;
        Some((accepted, listener))
    })
}

/// Answers without reading the request, and doesn't wait long for a slow client.
async fn respond_with_temporarily_unavailable(
    mut connection: impl AsyncWriteExt + Unpin,
) -> std::io::Result<()> {
    let write_response = async {
        let msg = b"HTTP/1.1 503 Service Unavailable\r\n\
                    Content-Type: text/plain;charset=utf-8\r\n\
                    Content-Length: 22\r\n\
                    \r\n\
                    Too many connections!\n";
        connection.write_all(msg).await?;
        connection.shutdown().await
    };
    select! {
         result = write_response => result,
         _ = sleep(Duration::from_secs(1)) => Err(std::io::ErrorKind::TimedOut.into()),
    }
}

/// Gracefully terminate `connection` if `want_shutdown` resolves.
async fn with_graceful_shutdown<I, S, B>(
    connection: http1::Connection<I, S>,
    want_shutdown: impl Future,
) -> Result<(), hyper::Error>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + 'static,
    S: HttpService<Incoming, ResBody = B>,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    B: Body + 'static,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    // Polling and graceful_shutdown both need the connection exclusively.
    let mut connection = pin!(connection);
    let mut want_shutdown = pin!(want_shutdown.fuse());
    std::future::poll_fn(|cx| {
        if want_shutdown.as_mut().poll(cx).is_ready() {
            connection.as_mut().graceful_shutdown();
        }
        connection.as_mut().poll(cx)
    })
    .await
}
