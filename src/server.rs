use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    sync::{oneshot, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    error::Error,
    node::KademliaNode,
    republish,
    transport::{socketaddr_to_multiaddr, TcpStream, Transport},
};

/// Owner side of a running server.
///
/// Dropping the handle closes the listener just like [`ServerHandle::shutdown`],
/// without waiting for the accept loop to finish.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    accept_loop: Option<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Closes the listener, waits until the accept loop has stopped and stops
    /// the maintenance job. Connections already accepted finish on their own.
    pub async fn shutdown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Some(accept_loop) = self.accept_loop.take() {
            if let Err(e) = accept_loop.await {
                warn!("Accept loop ended abnormally: {e}");
            }
        }

        if let Some(maintenance) = self.maintenance.take() {
            maintenance.abort();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(maintenance) = self.maintenance.take() {
            maintenance.abort();
        }
    }
}

/// Pause after a failed accept, e.g. when the process is out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) fn spawn(node: KademliaNode, transport: Transport) -> ServerHandle {
    let local_addr = transport.local_addr();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let limiter = node
        .config()
        .max_connections()
        .map(|max| Arc::new(Semaphore::new(max.max(1))));

    let maintenance = node
        .config()
        .maintenance_interval()
        .map(|period| tokio::spawn(republish::run(node.clone(), period)));

    let accept_loop = tokio::spawn(accept_loop(node, transport, shutdown_rx, limiter));

    ServerHandle {
        local_addr,
        shutdown: Some(shutdown_tx),
        accept_loop: Some(accept_loop),
        maintenance,
    }
}

async fn accept_loop(
    node: KademliaNode,
    transport: Transport,
    mut shutdown: oneshot::Receiver<()>,
    limiter: Option<Arc<Semaphore>>,
) {
    debug!(
        "Serving on {}",
        socketaddr_to_multiaddr(&transport.local_addr())
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = transport.accept() => {
                let (stream, remote_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                        }
                    }
                };

                // Waiting for a free slot must not hold off shutdown.
                let permit = match &limiter {
                    Some(limiter) => tokio::select! {
                        _ = &mut shutdown => break,
                        permit = limiter.clone().acquire_owned() => match permit {
                            Ok(permit) => Some(permit),
                            Err(_) => break,
                        },
                    },
                    None => None,
                };

                let node = node.clone();
                tokio::spawn(async move {
                    handle_connection(node, stream, remote_addr).await;
                    drop(permit);
                });
            }
        }
    }

    debug!("Listener on {} closed", transport.local_addr());
}

/// Reads one message, dispatches it and writes the reply if there is one.
async fn handle_connection(node: KademliaNode, mut stream: TcpStream, remote_addr: SocketAddr) {
    let read = tokio::time::timeout(node.config().rpc_timeout(), stream.read_msg()).await;

    let request = match read {
        Ok(Ok(request)) => request,
        Ok(Err(Error::UnknownMessageKind(kind))) => {
            warn!(%remote_addr, "Dropping message of unknown kind {kind}");
            return;
        }
        Ok(Err(e)) if e.is_decode() => {
            debug!(%remote_addr, "Dropping undecodable message: {e}");
            return;
        }
        Ok(Err(e)) => {
            trace!(%remote_addr, "Connection closed before a message arrived: {e}");
            return;
        }
        Err(_) => {
            debug!(%remote_addr, "No message received in time");
            return;
        }
    };

    let Some(reply) = node.handle_message(request).await else {
        return;
    };

    // A peer that stops reading must not pin the connection forever.
    let respond = async {
        stream.write_msg(&reply).await?;
        stream.close().await?;
        Ok::<_, Error>(())
    };

    match tokio::time::timeout(node.config().rpc_timeout(), respond).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%remote_addr, "Failed to send reply: {e}"),
        Err(_) => debug!(%remote_addr, "Reply not taken in time"),
    }
}
