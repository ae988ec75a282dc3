use std::net::SocketAddr;
use std::sync::Arc;

use pivot_http::build_response;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::Sender;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::ServerShared;

/// An accepted client socket on its way to a worker. The permit accounts
/// for the connection against the global concurrency cap and is released
/// when the work unit ends.
pub(crate) struct Inbound {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub permit: Option<OwnedSemaphorePermit>,
}

/// The accept loop. Does no protocol work: accept, pick the next worker
/// round-robin, and hand the socket over its inbox. A full inbox blocks the
/// acceptor briefly, which is the load-shedding mechanism; a closed inbox
/// means the worker died and its slot is skipped.
pub(crate) async fn run_acceptor(
    shared: Arc<ServerShared>,
    listener: TcpListener,
    senders: Vec<Sender<Inbound>>,
    mut shutdown: watch::Receiver<bool>,
    gate: Arc<Semaphore>,
) {
    let mut next_worker: usize = 0;

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = shutdown.changed() => break,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                continue;
            }
        };

        let permit = match Arc::clone(&gate).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                tracing::warn!(
                    peer = %peer,
                    limit = shared.config.max_concurrent_connections,
                    "connection limit reached; shedding"
                );
                tokio::spawn(async move {
                    let mut stream = stream;
                    let response =
                        build_response(503, "Service Unavailable", "server at capacity");
                    let _ = stream.write_all(&response).await;
                    let _ = stream.shutdown().await;
                });
                continue;
            }
        };

        let mut inbound = Inbound {
            stream,
            peer,
            permit: Some(permit),
        };
        let mut dead_slots = 0;
        loop {
            if dead_slots >= senders.len() {
                tracing::error!("all workers are gone; stopping acceptor");
                return;
            }
            let index = next_worker % senders.len();
            next_worker = next_worker.wrapping_add(1);
            match senders[index].send(inbound).await {
                Ok(()) => break,
                Err(SendError(returned)) => {
                    inbound = returned;
                    dead_slots += 1;
                }
            }
        }
    }
}
