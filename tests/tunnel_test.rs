//! End-to-end tunnel tests
//!
//! Each test spins up in-process mock servers: an origin that answers one
//! HTTP request inside TLS, and zero or more CONNECT proxies that forward
//! the decrypted payload of their own TLS session to the next hop. The
//! client under test drives real sockets against them, so the observable
//! wire pattern is the production one: one TLS client-hello per layer,
//! one CONNECT per intermediate hop, the user's request innermost.

use nested_tunnel::tunnel::TunnelError;
use nested_tunnel::{Endpoint, Error, PinStore, Request, TlsSettings, TunnelConnection, TunnelState};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::RootCertStore;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use url::Url;

/// Throwaway certificate authority for one test
struct TestCa {
    issuer: Issuer<'static, KeyPair>,
    root_der: CertificateDer<'static>,
}

impl TestCa {
    fn new() -> Self {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, DnValue::Utf8String("Tunnel Test CA".into()));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

        let key = KeyPair::generate().expect("failed to generate CA key");
        let cert = params.self_signed(&key).expect("failed to self-sign CA");
        let root_der = cert.der().clone();

        Self {
            issuer: Issuer::new(params, key),
            root_der,
        }
    }

    /// Issue a server certificate for `host`
    fn leaf(&self, host: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let params = CertificateParams::new(vec![host.to_string()]).expect("leaf params");
        let key = KeyPair::generate().expect("failed to generate leaf key");
        let cert = params.signed_by(&key, &self.issuer).expect("failed to sign leaf");
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        (cert.der().clone(), key_der)
    }
}

fn acceptor(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> TlsAcceptor {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

fn settings(ca: &TestCa, pins: PinStore) -> TlsSettings {
    let mut roots = RootCertStore::empty();
    roots.add(ca.root_der.clone()).unwrap();
    TlsSettings::with_roots(roots, pins)
}

/// Read until the blank line ending an HTTP header block
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.expect("mock read");
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    head
}

/// Accept one TLS connection, answer the request with `response`, close
async fn run_origin(listener: TcpListener, acceptor: TlsAcceptor, response: &'static [u8]) -> Vec<u8> {
    let (tcp, _) = listener.accept().await.expect("origin accept");
    let mut tls = acceptor.accept(tcp).await.expect("origin tls accept");
    let head = read_head(&mut tls).await;
    tls.write_all(response).await.expect("origin write");
    tls.shutdown().await.ok();
    head
}

/// Accept one TLS connection, require a CONNECT, answer 200, then shuttle
/// bytes between the decrypted payload and the requested upstream
async fn run_proxy(listener: TcpListener, acceptor: TlsAcceptor) -> String {
    let (tcp, _) = listener.accept().await.expect("proxy accept");
    let mut tls = acceptor.accept(tcp).await.expect("proxy tls accept");

    let head = read_head(&mut tls).await;
    let head_text = String::from_utf8(head).expect("connect head utf8");
    let mut lines = head_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    assert_eq!(parts.next(), Some("CONNECT"));
    let target = parts.next().expect("connect target").to_string();

    let mut upstream = TcpStream::connect(&target).await.expect("proxy upstream connect");
    tls.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .expect("proxy write");
    let _ = tokio::io::copy_bidirectional(&mut tls, &mut upstream).await;

    request_line
}

/// Accept one TLS connection and refuse the CONNECT
async fn run_refusing_proxy(listener: TcpListener, acceptor: TlsAcceptor) {
    let (tcp, _) = listener.accept().await.expect("proxy accept");
    let mut tls = acceptor.accept(tcp).await.expect("proxy tls accept");
    read_head(&mut tls).await;
    tls.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
        .await
        .expect("proxy write");
    tls.shutdown().await.ok();
}

async fn bind_local() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

const OK_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nHello, layers";

#[tokio::test]
async fn test_direct_request() {
    let ca = TestCa::new();
    let (cert, key) = ca.leaf("localhost");
    let (listener, port) = bind_local().await;
    let origin = tokio::spawn(run_origin(listener, acceptor(cert, key), OK_RESPONSE));

    let targets = vec![Endpoint::new("localhost", port).unwrap()];
    let mut connection = TunnelConnection::new(targets, settings(&ca, PinStore::new())).unwrap();

    let request = Request::get(Url::parse("https://localhost/").unwrap())
        .with_header("X-Test", "direct");
    let response = connection.issue(request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_deref(), Some(b"Hello, layers" as &[u8]));

    let head = origin.await.unwrap();
    let head_text = String::from_utf8(head).unwrap();
    assert!(head_text.starts_with("GET / HTTP/1.1\r\n"));
    assert!(head_text.contains("X-Test: direct\r\n"));
    assert!(head_text.contains("Host: localhost\r\n"));
}

#[tokio::test]
async fn test_single_proxy_chain() {
    let ca = TestCa::new();

    let (origin_listener, origin_port) = bind_local().await;
    let (cert, key) = ca.leaf("localhost");
    let origin = tokio::spawn(run_origin(origin_listener, acceptor(cert, key), OK_RESPONSE));

    let (proxy_listener, proxy_port) = bind_local().await;
    let (cert, key) = ca.leaf("localhost");
    let proxy = tokio::spawn(run_proxy(proxy_listener, acceptor(cert, key)));

    let targets = vec![
        Endpoint::new("localhost", proxy_port).unwrap(),
        Endpoint::new("localhost", origin_port).unwrap(),
    ];
    let mut connection = TunnelConnection::new(targets, settings(&ca, PinStore::new())).unwrap();

    let request = Request::get(Url::parse("https://localhost/secret").unwrap());
    let response = connection.issue(request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_deref(), Some(b"Hello, layers" as &[u8]));

    // The proxy saw exactly one CONNECT for the origin
    let connect_line = proxy.await.unwrap();
    assert_eq!(
        connect_line,
        format!("CONNECT localhost:{} HTTP/1.1", origin_port)
    );

    // The origin saw the user's request, not the CONNECT
    let head_text = String::from_utf8(origin.await.unwrap()).unwrap();
    assert!(head_text.starts_with("GET /secret HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_two_proxy_chain() {
    let ca = TestCa::new();

    let (origin_listener, origin_port) = bind_local().await;
    let (cert, key) = ca.leaf("localhost");
    let origin = tokio::spawn(run_origin(origin_listener, acceptor(cert, key), OK_RESPONSE));

    let (second_listener, second_port) = bind_local().await;
    let (cert, key) = ca.leaf("localhost");
    let second_proxy = tokio::spawn(run_proxy(second_listener, acceptor(cert, key)));

    let (first_listener, first_port) = bind_local().await;
    let (cert, key) = ca.leaf("localhost");
    let first_proxy = tokio::spawn(run_proxy(first_listener, acceptor(cert, key)));

    let targets = vec![
        Endpoint::new("localhost", first_port).unwrap(),
        Endpoint::new("localhost", second_port).unwrap(),
        Endpoint::new("localhost", origin_port).unwrap(),
    ];
    let mut connection = TunnelConnection::new(targets, settings(&ca, PinStore::new())).unwrap();

    let request = Request::get(Url::parse("https://localhost/deep").unwrap());
    let response = connection.issue(request).await.unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.body.as_deref(), Some(b"Hello, layers" as &[u8]));

    // Hop order: the first proxy tunnels to the second, the second to the
    // origin, and only the origin sees the request
    assert_eq!(
        first_proxy.await.unwrap(),
        format!("CONNECT localhost:{} HTTP/1.1", second_port)
    );
    assert_eq!(
        second_proxy.await.unwrap(),
        format!("CONNECT localhost:{} HTTP/1.1", origin_port)
    );
    let head_text = String::from_utf8(origin.await.unwrap()).unwrap();
    assert!(head_text.starts_with("GET /deep HTTP/1.1\r\n"));
}

#[tokio::test]
async fn test_post_round_trip() {
    let ca = TestCa::new();
    let (cert, key) = ca.leaf("localhost");
    let (listener, port) = bind_local().await;
    let origin = tokio::spawn(async move {
        let acceptor = acceptor(cert, key);
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        let mut head = read_head(&mut tls).await;
        // Body may trail the header block in the same segments
        let split = head.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let mut body = head.split_off(split);
        while body.len() < 9 {
            let mut chunk = [0u8; 256];
            let n = tls.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        tls.write_all(b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        tls.shutdown().await.ok();
        (head, body)
    });

    let targets = vec![Endpoint::new("localhost", port).unwrap()];
    let mut connection = TunnelConnection::new(targets, settings(&ca, PinStore::new())).unwrap();

    let request = Request::post(
        Url::parse("https://localhost/items").unwrap(),
        bytes::Bytes::from_static(b"key=value"),
    );
    let response = connection.issue(request).await.unwrap();
    assert_eq!(response.status, 201);

    let (head, body) = origin.await.unwrap();
    let head_text = String::from_utf8(head).unwrap();
    assert!(head_text.starts_with("POST /items HTTP/1.1\r\n"));
    assert!(head_text.contains("Content-Length: 9\r\n"));
    assert_eq!(&body, b"key=value");
}

#[tokio::test]
async fn test_connect_refused_surfaces_status() {
    let ca = TestCa::new();
    let (cert, key) = ca.leaf("localhost");
    let (listener, port) = bind_local().await;
    let proxy = tokio::spawn(run_refusing_proxy(listener, acceptor(cert, key)));

    let targets = vec![
        Endpoint::new("localhost", port).unwrap(),
        Endpoint::new("localhost", 1).unwrap(),
    ];
    let mut connection = TunnelConnection::new(targets, settings(&ca, PinStore::new())).unwrap();

    let request = Request::get(Url::parse("https://localhost/").unwrap());
    let error = connection.issue(request).await.unwrap_err();

    match error {
        Error::Tunnel(TunnelError::UnexpectedResponse { status, .. }) => assert_eq!(status, 403),
        other => panic!("expected UnexpectedResponse, got {:?}", other),
    }
    // A failed request always leaves the machine inactive
    assert_eq!(connection.state(), TunnelState::Inactive);
    proxy.await.unwrap();
}

#[tokio::test]
async fn test_eof_before_response() {
    let ca = TestCa::new();
    let (cert, key) = ca.leaf("localhost");
    let (listener, port) = bind_local().await;
    let origin = tokio::spawn(async move {
        let acceptor = acceptor(cert, key);
        let (tcp, _) = listener.accept().await.unwrap();
        let mut tls = acceptor.accept(tcp).await.unwrap();
        read_head(&mut tls).await;
        // Hang up without answering
        tls.shutdown().await.ok();
    });

    let targets = vec![Endpoint::new("localhost", port).unwrap()];
    let mut connection = TunnelConnection::new(targets, settings(&ca, PinStore::new())).unwrap();

    let request = Request::get(Url::parse("https://localhost/").unwrap());
    let error = connection.issue(request).await.unwrap_err();
    assert!(matches!(error, Error::ConnectionClosed));
    origin.await.unwrap();
}

#[tokio::test]
async fn test_malformed_response_rejected() {
    let ca = TestCa::new();
    let (cert, key) = ca.leaf("localhost");
    let (listener, port) = bind_local().await;
    let origin = tokio::spawn(run_origin(
        listener,
        acceptor(cert, key),
        b"HTTP/1.1 999 Nope\r\n\r\n",
    ));

    let targets = vec![Endpoint::new("localhost", port).unwrap()];
    let mut connection = TunnelConnection::new(targets, settings(&ca, PinStore::new())).unwrap();

    let request = Request::get(Url::parse("https://localhost/").unwrap());
    let error = connection.issue(request).await.unwrap_err();
    assert!(matches!(error, Error::Http(_)));
    origin.await.unwrap();
}

#[tokio::test]
async fn test_paired_stream_close_is_idempotent() {
    use nested_tunnel::stream::{PairedStream, RawStream};

    let (listener, port) = bind_local().await;
    let server = tokio::spawn(async move {
        let _ = listener.accept().await;
    });

    let socket = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut stream = RawStream::new(socket);
    stream.close();
    stream.close();
    assert!(!stream.has_space_available());
    assert!(!stream.has_bytes_available());
    server.await.unwrap();
}

#[tokio::test]
async fn test_pinned_leaf_accepted() {
    let ca = TestCa::new();
    let (cert, key) = ca.leaf("localhost");
    let (listener, port) = bind_local().await;

    let mut pins = PinStore::new();
    pins.insert("localhost", cert.clone());

    let origin = tokio::spawn(run_origin(listener, acceptor(cert, key), OK_RESPONSE));

    let targets = vec![Endpoint::new("localhost", port).unwrap()];
    let mut connection = TunnelConnection::new(targets, settings(&ca, pins)).unwrap();

    let request = Request::get(Url::parse("https://localhost/").unwrap());
    let response = connection.issue(request).await.unwrap();
    assert_eq!(response.status, 200);
    origin.await.unwrap();
}

#[tokio::test]
async fn test_pin_mismatch_rejected() {
    let ca = TestCa::new();
    let (served_cert, key) = ca.leaf("localhost");
    let (other_cert, _) = ca.leaf("localhost");
    let (listener, port) = bind_local().await;

    // Pin a different, equally valid leaf
    let mut pins = PinStore::new();
    pins.insert("localhost", other_cert);

    let origin = tokio::spawn(async move {
        let acceptor = acceptor(served_cert, key);
        let (tcp, _) = listener.accept().await.unwrap();
        // Handshake fails once the client's verifier sees the wrong leaf
        let _ = acceptor.accept(tcp).await;
    });

    let targets = vec![Endpoint::new("localhost", port).unwrap()];
    let mut connection = TunnelConnection::new(targets, settings(&ca, pins)).unwrap();

    let request = Request::get(Url::parse("https://localhost/").unwrap());
    let error = connection.issue(request).await.unwrap_err();
    assert!(
        matches!(error, Error::Stream(_) | Error::ConnectionClosed),
        "expected a handshake failure, got {:?}",
        error
    );
    origin.await.unwrap();
}
