mod common;

use std::sync::Arc;

use common::{head_text, read_http_head, read_to_end_lossy, start_proxy, test_config};
use pivot_core::ProxyConfig;
use pivot_tls::{build_upstream_client_config, CaAuthority, CertificateStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connect_tunnel_without_interception_relays_bytes_unchanged() {
    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        let (mut stream, _) = upstream.accept().await.expect("accept");
        let mut buf = [0_u8; 4];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.expect("write");
    });

    let proxy = start_proxy(test_config(0)).await;
    let mut client = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let connect = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = upstream_addr.port()
    );
    client.write_all(connect.as_bytes()).await.expect("write CONNECT");

    let head = read_http_head(&mut client).await;
    assert!(
        head_text(&head).starts_with("HTTP/1.1 200 Connection Established\r\n"),
        "{}",
        head_text(&head)
    );

    client.write_all(b"ping").await.expect("write tunnel bytes");
    let mut buf = [0_u8; 4];
    client.read_exact(&mut buf).await.expect("read tunnel bytes");
    assert_eq!(&buf, b"pong");

    upstream_task.await.expect("upstream task");
    let _ = proxy.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interception_decrypts_and_plugin_header_reaches_upstream() {
    // Upstream: a TLS server with its own self-issued identity.
    let upstream_ca = CaAuthority::generate("upstream test CA", "upstream").expect("upstream CA");
    let upstream_store = CertificateStore::new(upstream_ca, 365, None);
    let upstream_leaf = upstream_store
        .leaf_for_host("127.0.0.1")
        .await
        .expect("upstream leaf");

    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    let upstream_task = tokio::spawn(async move {
        let acceptor = TlsAcceptor::from(Arc::clone(&upstream_leaf.server_config));
        let (tcp, _) = upstream.accept().await.expect("accept");
        let mut tls = acceptor.accept(tcp).await.expect("upstream TLS accept");

        let head = read_http_head(&mut tls).await;
        let text = head_text(&head);
        assert!(text.starts_with("GET /secret HTTP/1.1\r\n"), "{text}");
        assert!(text.contains("X-Seen: 1\r\n"), "{text}");

        tls.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\ndecoded")
            .await
            .expect("write response");
        tls.shutdown().await.expect("shutdown upstream TLS");
    });

    // Proxy: interception CA on disk, plugin appending a header.
    let ca_dir = tempfile::tempdir().expect("tempdir");
    let ca_cert_path = ca_dir.path().join("ca-cert.pem");
    let ca_key_path = ca_dir.path().join("ca-key.pem");
    CaAuthority::generate("pivot test CA", "pivot")
        .expect("proxy CA")
        .persist(&ca_cert_path, &ca_key_path)
        .expect("persist proxy CA");

    let config = ProxyConfig {
        ca_cert_file: Some(ca_cert_path),
        ca_key_file: Some(ca_key_path),
        upstream_tls_insecure_skip_verify: true,
        plugins: vec!["append_headers".to_string()],
        plugin_settings: [(
            "append_headers".to_string(),
            serde_json::json!({"headers": [["X-Seen", "1"]]}),
        )]
        .into_iter()
        .collect(),
        ..test_config(0)
    };
    let proxy = start_proxy(config).await;

    let mut tcp = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let connect = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = upstream_addr.port()
    );
    tcp.write_all(connect.as_bytes()).await.expect("write CONNECT");
    let head = read_http_head(&mut tcp).await;
    assert!(head_text(&head).starts_with("HTTP/1.1 200 Connection Established\r\n"));

    // TLS to the proxy's synthesized leaf; verification is off because the
    // test client has not installed the proxy CA.
    let connector = TlsConnector::from(build_upstream_client_config(true));
    let server_name = ServerName::try_from("127.0.0.1".to_string()).expect("server name");
    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .expect("TLS connect through tunnel");

    tls.write_all(b"GET /secret HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .expect("write intercepted request");
    tls.flush().await.expect("flush");

    let response = read_to_end_lossy(&mut tls).await;
    let text = head_text(&response);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.ends_with("decoded"), "{text}");

    upstream_task.await.expect("upstream task");
    let _ = proxy.shutdown.send(true);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn intercepted_leaf_is_signed_by_the_configured_ca() {
    let upstream_ca = CaAuthority::generate("upstream test CA", "upstream").expect("upstream CA");
    let upstream_store = CertificateStore::new(upstream_ca, 365, None);
    let upstream_leaf = upstream_store
        .leaf_for_host("127.0.0.1")
        .await
        .expect("upstream leaf");

    let upstream = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let upstream_addr = upstream.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let acceptor = TlsAcceptor::from(Arc::clone(&upstream_leaf.server_config));
        if let Ok((tcp, _)) = upstream.accept().await {
            if let Ok(mut tls) = acceptor.accept(tcp).await {
                let _ = read_http_head(&mut tls).await;
                let _ = tls
                    .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
                    .await;
            }
        }
    });

    let ca_dir = tempfile::tempdir().expect("tempdir");
    let ca_cert_path = ca_dir.path().join("ca-cert.pem");
    let ca_key_path = ca_dir.path().join("ca-key.pem");
    let proxy_ca = CaAuthority::generate("pivot test CA", "pivot").expect("proxy CA");
    proxy_ca
        .persist(&ca_cert_path, &ca_key_path)
        .expect("persist proxy CA");

    let leaf_mirror = ca_dir.path().join("leaves");
    let config = ProxyConfig {
        ca_cert_file: Some(ca_cert_path),
        ca_key_file: Some(ca_key_path),
        ca_cert_dir: Some(leaf_mirror.clone()),
        upstream_tls_insecure_skip_verify: true,
        ..test_config(0)
    };
    let proxy = start_proxy(config).await;

    let mut tcp = TcpStream::connect(proxy.addr).await.expect("connect proxy");
    let connect = format!(
        "CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n",
        port = upstream_addr.port()
    );
    tcp.write_all(connect.as_bytes()).await.expect("write CONNECT");
    let _ = read_http_head(&mut tcp).await;

    let connector = TlsConnector::from(build_upstream_client_config(true));
    let server_name = ServerName::try_from("127.0.0.1".to_string()).expect("server name");
    let mut tls = connector
        .connect(server_name, tcp)
        .await
        .expect("TLS connect through tunnel");
    tls.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nConnection: close\r\n\r\n")
        .await
        .expect("write request");
    let _ = read_to_end_lossy(&mut tls).await;

    // The leaf was mirrored to the configured cert dir.
    let mirrored = std::fs::read_to_string(leaf_mirror.join("127.0.0.1.pem"))
        .expect("mirrored leaf certificate");
    assert!(mirrored.contains("BEGIN CERTIFICATE"));
    let _ = proxy.shutdown.send(true);
}
