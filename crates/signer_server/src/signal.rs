// Copyright 2021-2024 SecureDNA Stiftung (SecureDNA Foundation) <licensing@securedna.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Process signals that drive reloads and shutdowns.

/// What a signal asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    /// `SIGHUP`: reread the config.
    Reload,
    /// First `SIGINT`: stop accepting connections and drain.
    GracefulShutdown,
    /// `SIGTERM`, or a `SIGINT` after the first: exit now.
    FastShutdown,
}

/// Signal handlers, registered once at startup.
///
/// **BEWARE:** Registering a handler through [`tokio`] is permanent for the process, so this
/// belongs near the entry point of a program, not in a library.
pub struct Signals {
    interrupts_seen: usize,
    #[cfg(unix)]
    hangup: tokio::signal::unix::Signal,
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    pub fn register() -> std::io::Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                interrupts_seen: 0,
                hangup: signal(SignalKind::hangup())?,
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
            })
        }
        #[cfg(not(unix))]
        Ok(Self { interrupts_seen: 0 })
    }

    /// Waits for the next signal.
    pub async fn next(&mut self) -> Request {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.hangup.recv() => Request::Reload,
                _ = self.terminate.recv() => Request::FastShutdown,
                _ = self.interrupt.recv() => self.interrupted(),
            }
        }
        // There's no SIGHUP or SIGTERM here; Ctrl-C is all we get.
        #[cfg(not(unix))]
        {
            match tokio::signal::ctrl_c().await {
                Ok(()) => self.interrupted(),
                Err(_) => std::future::pending().await,
            }
        }
    }

    /// Every signal from here on, as a stream.
    pub fn into_stream(self) -> impl futures::Stream<Item = Request> {
        futures::stream::unfold(self, |mut signals| async move {
            let request = signals.next().await;
            Some((request, signals))
        })
    }

    fn interrupted(&mut self) -> Request {
        self.interrupts_seen += 1;
        interrupt_request(self.interrupts_seen)
    }
}

fn interrupt_request(interrupts_seen: usize) -> Request {
    if interrupts_seen > 1 {
        Request::FastShutdown
    } else {
        Request::GracefulShutdown
    }
}
