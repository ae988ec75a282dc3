use std::path::PathBuf;
use std::process::ExitCode;

use pivot_core::ProxyConfig;
use pivot_proxy::{init_logging, install_signal_handlers, ProxyServer};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn run() -> Result<(), u8> {
    let config = match load_config() {
        Ok(config) => config,
        Err(message) => {
            eprintln!("pivot: {message}");
            return Err(1);
        }
    };

    let log_handle = match init_logging(&config.log_level, config.log_file.as_deref()) {
        Ok(handle) => handle,
        Err(error) => {
            eprintln!("pivot: failed to open log file: {error}");
            return Err(1);
        }
    };

    let pid_file = config.pid_file.clone();
    if let Some(path) = &pid_file {
        if let Err(error) = std::fs::write(path, std::process::id().to_string()) {
            tracing::error!(%error, path = %path.display(), "failed to write pid file");
            return Err(1);
        }
    }

    let result = serve(config, log_handle).await;

    if let Some(path) = &pid_file {
        let _ = std::fs::remove_file(path);
    }
    result
}

async fn serve(config: ProxyConfig, log_handle: pivot_proxy::LogHandle) -> Result<(), u8> {
    let server = match ProxyServer::new(config) {
        Ok(server) => server,
        Err(error) => {
            tracing::error!(%error, "startup failed");
            eprintln!("pivot: {error}");
            return Err(error.exit_code() as u8);
        }
    };

    let listener = match server.bind_listener().await {
        Ok(listener) => listener,
        Err(error) => {
            tracing::error!(%error, "bind failed");
            eprintln!("pivot: {error}");
            return Err(error.exit_code() as u8);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signal_task = install_signal_handlers(server.clone(), shutdown_tx, log_handle);

    let result = server.run_with_listener(listener, shutdown_rx).await;
    signal_task.abort();

    match result {
        Ok(()) => Ok(()),
        Err(error) => {
            tracing::error!(%error, "server loop failed");
            Err(1)
        }
    }
}

fn load_config() -> Result<ProxyConfig, String> {
    let mut args = std::env::args().skip(1);
    let mut config_path: Option<PathBuf> = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let value = args
                    .next()
                    .ok_or_else(|| "--config requires a file path".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            "--help" | "-h" => {
                return Err("usage: pivot [--config <config.json>]".to_string());
            }
            other => {
                return Err(format!("unrecognized argument: {other}"));
            }
        }
    }

    match config_path {
        Some(path) => ProxyConfig::from_file(&path).map_err(|error| error.to_string()),
        None => {
            let config = ProxyConfig::default();
            config.validate().map_err(|error| error.to_string())?;
            Ok(config)
        }
    }
}
