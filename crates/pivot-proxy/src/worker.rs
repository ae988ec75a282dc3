use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::acceptor::Inbound;
use crate::handler::handle_connection;
use crate::ServerShared;

/// One worker: receives sockets over its inbox and owns the resulting work
/// units until they terminate. Work units never migrate between workers.
///
/// On shutdown the worker stops taking new work and drains in-flight units
/// until the grace deadline, then aborts whatever remains.
pub(crate) async fn run_worker(
    shared: Arc<ServerShared>,
    mut inbox: mpsc::Receiver<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut units: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            received = inbox.recv() => match received {
                Some(inbound) => {
                    units.spawn(handle_connection(Arc::clone(&shared), inbound));
                }
                None => break,
            },
            _ = shutdown.changed() => break,
            Some(_) = units.join_next(), if !units.is_empty() => {}
        }
    }

    drain_until_grace(units, &shared).await;
}

async fn drain_until_grace(mut units: JoinSet<()>, shared: &Arc<ServerShared>) {
    let deadline = Instant::now() + shared.config.shutdown_grace();
    while !units.is_empty() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            tracing::warn!(
                in_flight = units.len(),
                "grace deadline reached; aborting remaining work units"
            );
            units.shutdown().await;
            return;
        }
        match tokio::time::timeout(remaining, units.join_next()).await {
            Ok(Some(_)) => {}
            Ok(None) => return,
            Err(_) => {
                tracing::warn!(
                    in_flight = units.len(),
                    "grace deadline reached; aborting remaining work units"
                );
                units.shutdown().await;
                return;
            }
        }
    }
}
