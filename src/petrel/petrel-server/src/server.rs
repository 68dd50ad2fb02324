/*
 * Petrel mail transfer engine
 * Copyright (C) 2024 the Petrel developers
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

use crate::ServerConfig;
use anyhow::Context;
use petrel_common::Reply;
use petrel_protocol::{Backend, ConnectionInfo, Receiver};
use tokio_stream::StreamExt;

/// Create a `TcpListener` ready to be handed to [`Server::listen`].
///
/// # Errors
///
/// * failed to bind to the socket address
/// * failed to set the listener to non blocking
#[inline]
pub fn socket_bind_anyhow<A: std::net::ToSocketAddrs + std::fmt::Debug>(
    addr: A,
) -> anyhow::Result<std::net::TcpListener> {
    let socket = std::net::TcpListener::bind(&addr)
        .with_context(|| format!("Failed to bind socket on addr: '{addr:?}'"))?;

    socket
        .set_nonblocking(true)
        .with_context(|| format!("Failed to set non-blocking socket on addr: '{addr:?}'"))?;

    Ok(socket)
}

type ListenerStreamItem = std::io::Result<(tokio::net::TcpStream, std::net::SocketAddr)>;

fn listener_to_stream(
    listener: &tokio::net::TcpListener,
) -> impl tokio_stream::Stream<Item = ListenerStreamItem> + '_ {
    async_stream::try_stream! {
        loop {
            yield listener.accept().await?;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Running,
    Graceful,
    Abort,
}

/// The graceful-shutdown deadline expired with handlers still running.
#[derive(Debug, thiserror::Error)]
#[error("graceful shutdown did not finish within {0:?}")]
pub struct ShutdownTimedOut(
    /// The deadline that expired.
    pub std::time::Duration,
);

/// Remote control over a running [`Server::listen`] loop.
#[derive(Clone)]
pub struct ShutdownHandle {
    signal: std::sync::Arc<tokio::sync::watch::Sender<Lifecycle>>,
    done: tokio::sync::watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Stop accepting and wait for every connection handler to finish, up
    /// to `deadline`.
    ///
    /// # Errors
    ///
    /// * [`ShutdownTimedOut`] when handlers are still running at the
    ///   deadline; follow up with [`ShutdownHandle::abort`]
    #[inline]
    pub async fn graceful(&self, deadline: std::time::Duration) -> Result<(), ShutdownTimedOut> {
        let _ignored = self.signal.send(Lifecycle::Graceful);
        let mut done = self.done.clone();
        tokio::time::timeout(deadline, async move {
            while !*done.borrow() {
                if done.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_elapsed| ShutdownTimedOut(deadline))
    }

    /// Abort every connection handler and stop immediately.
    #[inline]
    pub fn abort(&self) {
        let _ignored = self.signal.send(Lifecycle::Abort);
    }
}

/// TCP/IP server: owns the listener set, spawns one task per accepted
/// connection and funnels each into a [`Receiver`].
pub struct Server<B: Backend + 'static> {
    conn_max_reach_reply: Reply,

    config: std::sync::Arc<ServerConfig>,
    backend: std::sync::Arc<B>,
    signal: std::sync::Arc<tokio::sync::watch::Sender<Lifecycle>>,
    lifecycle: tokio::sync::watch::Receiver<Lifecycle>,
    done: std::sync::Arc<tokio::sync::watch::Sender<bool>>,
    done_rx: tokio::sync::watch::Receiver<bool>,
}

impl<B: Backend + 'static> Server<B> {
    /// Create a server around an application backend.
    #[must_use]
    #[inline]
    #[allow(clippy::expect_used)]
    pub fn new(config: std::sync::Arc<ServerConfig>, backend: std::sync::Arc<B>) -> Self {
        let (signal, lifecycle) = tokio::sync::watch::channel(Lifecycle::Running);
        let (done, done_rx) = tokio::sync::watch::channel(false);
        Self {
            conn_max_reach_reply: "421 4.3.2 Cannot process connection, closing\r\n"
                .parse::<Reply>()
                .expect("valid smtp reply"),
            config,
            backend,
            signal: std::sync::Arc::new(signal),
            lifecycle,
            done: std::sync::Arc::new(done),
            done_rx,
        }
    }

    /// Bind every configured address.
    ///
    /// # Errors
    ///
    /// * see [`socket_bind_anyhow`]
    #[inline]
    pub fn bind(&self) -> anyhow::Result<Vec<std::net::TcpListener>> {
        self.config.listen.iter().map(socket_bind_anyhow).collect()
    }

    /// A handle for shutting the accept loop down from elsewhere.
    #[must_use]
    #[inline]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            signal: self.signal.clone(),
            done: self.done_rx.clone(),
        }
    }

    #[tracing::instrument(name = "handle-client", skip_all, fields(client = %client_addr, server = %server_addr))]
    fn handle_client(
        &self,
        handlers: &mut tokio::task::JoinSet<()>,
        client_counter: &std::sync::Arc<std::sync::atomic::AtomicI64>,
        mut stream: tokio::net::TcpStream,
        client_addr: std::net::SocketAddr,
        server_addr: std::net::SocketAddr,
    ) {
        let kind = self.config.receiver.kind;
        tracing::info!(%kind, "Connection accepted.");

        if self.config.client_count_max != -1
            && client_counter.load(std::sync::atomic::Ordering::SeqCst)
                >= self.config.client_count_max
        {
            tracing::warn!(
                max = self.config.client_count_max,
                "Connection count max reached, rejecting connection.",
            );

            let refusal = self.conn_max_reach_reply.clone();
            handlers.spawn(async move {
                if let Err(error) = tokio::io::AsyncWriteExt::write_all(
                    &mut stream,
                    refusal.as_ref().as_bytes(),
                )
                .await
                {
                    tracing::error!(%error, "Code delivery failure.");
                }
                if let Err(error) = tokio::io::AsyncWriteExt::shutdown(&mut stream).await {
                    tracing::error!(%error, "Closing connection failure.");
                }
            });
            return;
        }

        client_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

        let info = ConnectionInfo::new(client_addr, server_addr, kind);
        let receiver = Receiver::new(
            stream,
            self.backend.clone(),
            std::sync::Arc::new(self.config.receiver.clone()),
        );
        let counter = client_counter.clone();
        handlers.spawn(async move {
            let uuid = info.uuid;
            if let Err(error) = receiver.serve(info).await {
                tracing::error!(%error, %uuid, "Connection closed abnormally.");
            } else {
                tracing::info!(%uuid, "Connection closed cleanly.");
            }
            counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        });
    }

    /// Main loop: accept until a shutdown is requested, then settle the
    /// remaining handlers (waiting on graceful, aborting on abort).
    ///
    /// # Errors
    ///
    /// * failed to convert sockets to [`tokio::net::TcpListener`]
    /// * a listener died
    #[tracing::instrument(skip_all)]
    #[inline]
    pub async fn listen(mut self, sockets: Vec<std::net::TcpListener>) -> anyhow::Result<()> {
        let listeners = sockets
            .into_iter()
            .map(tokio::net::TcpListener::from_std)
            .collect::<std::io::Result<Vec<tokio::net::TcpListener>>>()?;

        let client_counter =
            std::sync::Arc::new(std::sync::atomic::AtomicI64::new(0));
        let mut handlers = tokio::task::JoinSet::new();

        let mode;
        {
            let mut map = tokio_stream::StreamMap::new();
            for listener in &listeners {
                map.insert(
                    listener.local_addr().context("retrieve local address")?,
                    Box::pin(listener_to_stream(listener)),
                );
            }

            tracing::info!(
                interfaces = ?map.keys().collect::<Vec<_>>(),
                "Listening for clients.",
            );

            loop {
                tokio::select! {
                    changed = self.lifecycle.changed() => {
                        mode = if changed.is_err() {
                            Lifecycle::Abort
                        } else {
                            *self.lifecycle.borrow()
                        };
                        break;
                    }
                    accepted = map.next() => {
                        let Some((server_addr, client)) = accepted else {
                            mode = Lifecycle::Graceful;
                            break;
                        };
                        let (stream, client_addr) = client?;
                        self.handle_client(
                            &mut handlers,
                            &client_counter,
                            stream,
                            client_addr,
                            server_addr,
                        );
                        // reap whatever already finished
                        while handlers.try_join_next().is_some() {}
                    }
                }
            }
            // the accept sockets close here, with the map and listeners
        }
        drop(listeners);

        match mode {
            Lifecycle::Abort => {
                tracing::warn!("Aborting every open connection.");
                handlers.abort_all();
            }
            Lifecycle::Graceful | Lifecycle::Running => {
                tracing::info!(
                    open = handlers.len(),
                    "Accept loop closed, waiting for connections to settle.",
                );
            }
        }
        // a graceful wait can still be escalated to an abort
        loop {
            tokio::select! {
                joined = handlers.join_next() => {
                    if joined.is_none() {
                        break;
                    }
                }
                changed = self.lifecycle.changed() => {
                    if changed.is_ok() && *self.lifecycle.borrow() == Lifecycle::Abort {
                        tracing::warn!("Aborting every open connection.");
                        handlers.abort_all();
                    }
                }
            }
        }

        let _ignored = self.done.send(true);
        Ok(())
    }
}
