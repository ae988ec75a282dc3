use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{LogHandle, ProxyServer};

/// Wire process signals to the server: SIGINT/SIGTERM start graceful
/// shutdown, SIGHUP reloads the plugin chain and CA material, SIGUSR1
/// reopens the log file.
pub fn install_signal_handlers(
    server: ProxyServer,
    shutdown_tx: watch::Sender<bool>,
    log_handle: LogHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run_signal_loop(server, shutdown_tx, log_handle).await;
    })
}

#[cfg(unix)]
async fn run_signal_loop(server: ProxyServer, shutdown_tx: watch::Sender<bool>, log: LogHandle) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGINT handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGTERM handler");
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGHUP handler");
            return;
        }
    };
    let mut user1 = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "failed to install SIGUSR1 handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                tracing::info!("SIGINT received; shutting down");
                let _ = shutdown_tx.send(true);
                return;
            }
            _ = terminate.recv() => {
                tracing::info!("SIGTERM received; shutting down");
                let _ = shutdown_tx.send(true);
                return;
            }
            _ = hangup.recv() => {
                match server.reload() {
                    Ok(()) => {}
                    Err(error) => {
                        tracing::error!(%error, "SIGHUP reload failed; keeping previous state");
                    }
                }
            }
            _ = user1.recv() => {
                match log.reopen() {
                    Ok(()) => tracing::info!("log file reopened"),
                    Err(error) => tracing::error!(%error, "log file reopen failed"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn run_signal_loop(_server: ProxyServer, shutdown_tx: watch::Sender<bool>, _log: LogHandle) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("interrupt received; shutting down");
        let _ = shutdown_tx.send(true);
    }
}
