//! TCP server: accepts connections and runs one session task per connection.

use crate::runtime::{connection, Protocol};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, trace, Instrument};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance for one protocol
pub struct Server<S> {
    listener: TcpListener,
    protocol: Arc<Protocol<S>>,
    connection_limit: Arc<Semaphore>,
}

impl<S: Send + 'static> Server<S> {
    /// Bind `addr` and prepare to serve `protocol`.
    ///
    /// An IPv6 wildcard address also accepts IPv4 clients. Must be called
    /// from within a Tokio runtime.
    pub fn bind(addr: SocketAddr, protocol: Protocol<S>, max_connections: usize) -> io::Result<Self> {
        let listener = TcpListener::from_std(create_listener(addr)?)?;

        Ok(Server {
            listener,
            protocol: Arc::new(protocol),
            connection_limit: Arc::new(Semaphore::new(max_connections.max(1))),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until Ctrl-C.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Accept connections until `shutdown` completes. Sessions already
    /// running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            address = %self.local_addr()?,
            protocol = self.protocol.name(),
            "Server listening"
        );
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.connection_limit).acquire_owned() => {
                    permit.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
                }
            };

            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer, permit),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        info!("Server shutting down");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr, permit: OwnedSemaphorePermit) {
        let protocol = Arc::clone(&self.protocol);
        let span = info_span!("conn", peer = %peer);

        tokio::spawn(
            async move {
                debug!("New connection");
                if let Err(e) = stream.set_nodelay(true) {
                    trace!(error = %e, "Failed to set TCP_NODELAY");
                }
                let reason = connection::serve(stream, protocol).await;
                debug!(?reason, "Connection closed");
                drop(permit);
            }
            .instrument(span),
        );
    }
}

/// Create a non-blocking listener with SO_REUSEADDR. IPv6 sockets are dual
/// stack.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
