//! Control channel against a local WebSocket broker

use bored_cert::{generate_keypair, KeyPair};
use bored_proto::{Frame, StreamTransport};
use bored_transport::{ensure_crypto_provider, ChannelConnector, ConnectionError};
use bored_transport_websocket::{HttpConnectProxy, WebSocketConfig, WebSocketConnector};
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;

const TOKEN: &str = "test-token";

fn identity() -> KeyPair {
    generate_keypair("team-a", None).unwrap()
}

fn check_request(req: &Request, response: Response) -> Result<Response, ErrorResponse> {
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", TOKEN));

    if req.uri().path() != "/agent/connect" {
        let mut response = ErrorResponse::new(None);
        *response.status_mut() = StatusCode::NOT_FOUND;
        return Err(response);
    }
    if !authorized {
        let mut response = ErrorResponse::new(None);
        *response.status_mut() = StatusCode::UNAUTHORIZED;
        return Err(response);
    }
    Ok(response)
}

/// Accepts one WebSocket, splits each inbound frame in two messages and echoes it back
async fn serve_echo<S>(io: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(io, check_request).await else {
        return;
    };

    while let Some(Ok(message)) = ws.next().await {
        if let Message::Binary(data) = message {
            let (head, tail) = data.split_at(data.len() / 2);
            if ws.send(Message::Binary(head.to_vec())).await.is_err() {
                break;
            }
            if ws.send(Message::Binary(tail.to_vec())).await.is_err() {
                break;
            }
        }
    }
}

async fn spawn_broker() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(serve_echo(socket));
        }
    });
    addr
}

async fn spawn_tls_broker() -> SocketAddr {
    ensure_crypto_provider();

    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![CertificateDer::from(cert.der().to_vec())],
            PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
        )
        .unwrap();
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(tls) = acceptor.accept(socket).await {
                    serve_echo(tls).await;
                }
            });
        }
    });
    addr
}

/// Minimal CONNECT proxy recording the request head it received
async fn spawn_proxy(seen: Arc<Mutex<Vec<String>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            let seen = seen.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                while !head.ends_with(b"\r\n\r\n") {
                    if client.read_exact(&mut byte).await.is_err() {
                        return;
                    }
                    head.push(byte[0]);
                }
                let head = String::from_utf8_lossy(&head).to_string();
                let target = head
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or_default()
                    .to_string();
                seen.lock().unwrap().push(head);

                let Ok(mut upstream) = TcpStream::connect(target).await else {
                    let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
                    return;
                };
                if client
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .is_err()
                {
                    return;
                }
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });

    addr
}

async fn round_trip(connector: &WebSocketConnector) {
    let (mut sink, mut stream) = connector.connect(&identity()).await.unwrap().into_parts();

    let frames = vec![
        Frame::open(1, "10.0.0.5:443", StreamTransport::Tls),
        Frame::data(1, vec![42u8; 10_000]),
        Frame::close(1, "eof"),
    ];
    for frame in &frames {
        sink.send(frame.clone()).await.unwrap();
    }
    for frame in frames {
        let echoed = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(echoed, frame);
    }
}

#[tokio::test]
async fn test_frames_survive_message_splitting() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let addr = spawn_broker().await;
    let config = WebSocketConfig::new(&format!("http://{}", addr), TOKEN).unwrap();
    let connector = WebSocketConnector::new(config).unwrap();

    round_trip(&connector).await;
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let addr = spawn_broker().await;
    let config = WebSocketConfig::new(&format!("http://{}", addr), "wrong").unwrap();
    let connector = WebSocketConnector::new(config).unwrap();

    let result = connector.connect(&identity()).await;
    assert!(matches!(result, Err(ConnectionError::Unauthorized(_))));
}

#[tokio::test]
async fn test_refused_is_network_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = WebSocketConfig::new(&format!("http://{}", addr), TOKEN).unwrap();
    let connector = WebSocketConnector::new(config).unwrap();

    let result = connector.connect(&identity()).await;
    assert!(matches!(result, Err(ConnectionError::NetworkUnreachable(_))));
}

#[tokio::test]
async fn test_silent_server_times_out() {
    // Accepts TCP but never completes the upgrade
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let config = WebSocketConfig::new(&format!("http://{}", addr), TOKEN)
        .unwrap()
        .with_connect_timeout(Duration::from_millis(200));
    let connector = WebSocketConnector::new(config).unwrap();

    let result = connector.connect(&identity()).await;
    assert!(matches!(result, Err(ConnectionError::NetworkUnreachable(_))));
}

#[tokio::test]
async fn test_connect_through_proxy() {
    let broker = spawn_broker().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let proxy = spawn_proxy(seen.clone()).await;

    let config = WebSocketConfig::new(&format!("http://{}", broker), TOKEN)
        .unwrap()
        .with_proxy(HttpConnectProxy::from_url(&format!("http://agent:pw@{}", proxy)).unwrap());
    let connector = WebSocketConnector::new(config).unwrap();

    round_trip(&connector).await;

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with(&format!("CONNECT {} HTTP/1.1", broker)));
    // base64("agent:pw")
    assert!(seen[0].contains("Proxy-Authorization: Basic YWdlbnQ6cHc="));
}

#[tokio::test]
async fn test_wss_with_client_certificate() {
    let addr = spawn_tls_broker().await;
    let config = WebSocketConfig::new(&format!("https://localhost:{}", addr.port()), TOKEN)
        .unwrap()
        .with_insecure_skip_verify();
    let connector = WebSocketConnector::new(config).unwrap();

    round_trip(&connector).await;
}

#[tokio::test]
async fn test_wss_untrusted_broker_fails_handshake() {
    let addr = spawn_tls_broker().await;
    let config =
        WebSocketConfig::new(&format!("https://localhost:{}", addr.port()), TOKEN).unwrap();
    let connector = WebSocketConnector::new(config).unwrap();

    let result = connector.connect(&identity()).await;
    assert!(matches!(result, Err(ConnectionError::HandshakeFailed(_))));
}
