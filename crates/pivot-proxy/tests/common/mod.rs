#![allow(dead_code)]

use std::net::SocketAddr;

use pivot_core::ProxyConfig;
use pivot_plugin::VecAccessLog;
use pivot_proxy::{ProxyServer, ProxyServerBuilder};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct RunningProxy {
    pub addr: SocketAddr,
    pub access_log: VecAccessLog,
    pub shutdown: watch::Sender<bool>,
    pub task: JoinHandle<std::io::Result<()>>,
}

pub async fn start_proxy(config: ProxyConfig) -> RunningProxy {
    start_proxy_with(ProxyServer::builder(config)).await
}

pub async fn start_proxy_with(builder: ProxyServerBuilder) -> RunningProxy {
    let access_log = VecAccessLog::default();
    let server = builder
        .access_log(std::sync::Arc::new(access_log.clone()))
        .build()
        .expect("build proxy server");

    let listener = server.bind_listener().await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy local addr");
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(server.run_with_listener(listener, shutdown_rx));

    RunningProxy {
        addr,
        access_log,
        shutdown,
        task,
    }
}

pub fn test_config(port: u16) -> ProxyConfig {
    ProxyConfig {
        hostname: "127.0.0.1".to_string(),
        port,
        num_workers: 2,
        timeout_secs: 5,
        connect_timeout_secs: 2,
        shutdown_grace_secs: 1,
        ..ProxyConfig::default()
    }
}

pub async fn read_http_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buffer = [0_u8; 1024];
    while !data.windows(4).any(|window| window == b"\r\n\r\n") {
        let read = stream.read(&mut buffer).await.expect("read HTTP head");
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..read]);
    }
    data
}

pub async fn read_to_end_lossy<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buffer = [0_u8; 1024];
    loop {
        match stream.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => out.extend_from_slice(&buffer[..read]),
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                        | std::io::ErrorKind::BrokenPipe
                ) =>
            {
                break;
            }
            Err(error) => panic!("read failed: {error}"),
        }
    }
    out
}

pub fn head_text(head: &[u8]) -> String {
    String::from_utf8_lossy(head).to_string()
}

pub fn content_length_of(head: &[u8]) -> usize {
    for line in head_text(head).split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                return value.trim().parse().expect("valid content-length");
            }
        }
    }
    0
}
