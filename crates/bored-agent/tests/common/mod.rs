//! Fake broker and local destinations shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bored_agent::{AgentOptions, AgentProxy, AllowAll, SessionConfig};
use bored_cert::KeyPair;
use bored_proto::{Frame, FrameCodec, DEFAULT_MAX_FRAME_SIZE};
use bored_transport::{
    ChannelConnector, ConnectionError, ControlChannel, LocalTlsConfig, TcpLocalConnector,
};
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

pub type BrokerEnd = Framed<DuplexStream, FrameCodec>;

/// Connector handing the broker side of every channel to the test
pub struct FakeBroker {
    accepted: mpsc::UnboundedSender<BrokerEnd>,
    pub failures: Mutex<VecDeque<ConnectionError>>,
}

#[async_trait]
impl ChannelConnector for FakeBroker {
    async fn connect(&self, _identity: &KeyPair) -> Result<ControlChannel, ConnectionError> {
        if let Some(e) = self.failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let (agent, broker) = tokio::io::duplex(64 * 1024);
        let _ = self
            .accepted
            .send(Framed::new(broker, FrameCodec::new(DEFAULT_MAX_FRAME_SIZE)));
        Ok(ControlChannel::from_io(
            agent,
            DEFAULT_MAX_FRAME_SIZE,
            "fake-broker",
        ))
    }
}

pub fn test_options() -> AgentOptions {
    AgentOptions {
        session: SessionConfig {
            connect_timeout: Duration::from_secs(2),
            keepalive_interval: Duration::from_secs(60),
            keepalive_timeout: Duration::from_secs(60),
            reconnect_delay: Duration::from_millis(10),
            max_reconnect_delay: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(2),
            outbound_queue: 1024,
        },
        ..AgentOptions::default()
    }
}

pub fn local_connector() -> Arc<TcpLocalConnector> {
    let tls = LocalTlsConfig::default().build().unwrap();
    Arc::new(TcpLocalConnector::new(Duration::from_secs(2), tls))
}

pub struct Harness {
    pub proxy: Arc<AgentProxy>,
    pub connector: Arc<FakeBroker>,
    pub brokers: mpsc::UnboundedReceiver<BrokerEnd>,
}

impl Harness {
    pub fn new(options: AgentOptions) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (accepted, brokers) = mpsc::unbounded_channel();
        let connector = Arc::new(FakeBroker {
            accepted,
            failures: Mutex::new(VecDeque::new()),
        });
        let proxy = AgentProxy::new(
            options,
            connector.clone(),
            local_connector(),
            Arc::new(AllowAll),
        );
        proxy
            .init(bored_cert::generate_keypair("team-a", None).unwrap())
            .unwrap();

        Self {
            proxy: Arc::new(proxy),
            connector,
            brokers,
        }
    }

    /// Connect and return the broker side of the first channel
    pub async fn connected(options: AgentOptions) -> (Self, BrokerEnd) {
        let mut harness = Self::new(options);
        harness.proxy.connect().await.unwrap();
        let broker = harness.next_broker().await;
        (harness, broker)
    }

    pub async fn next_broker(&mut self) -> BrokerEnd {
        tokio::time::timeout(Duration::from_secs(5), self.brokers.recv())
            .await
            .expect("agent did not connect")
            .expect("connector dropped")
    }

    pub async fn wait_for_streams(&self, count: usize) {
        for _ in 0..500 {
            if self.proxy.active_streams().await == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {} streams, have {}",
            count,
            self.proxy.active_streams().await
        );
    }
}

/// Next frame from the agent, answering keepalives
pub async fn next_frame(broker: &mut BrokerEnd) -> Frame {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), broker.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("control channel closed")
            .expect("undecodable frame");
        match frame {
            Frame::Ping { nonce } => broker.send(Frame::Pong { nonce }).await.unwrap(),
            frame => return frame,
        }
    }
}

/// Next frame that is not a window update
pub async fn next_stream_frame(broker: &mut BrokerEnd) -> Frame {
    loop {
        match next_frame(broker).await {
            Frame::WindowUpdate { .. } => continue,
            frame => return frame,
        }
    }
}

/// Echo server; every closed connection is reported on the returned channel
pub async fn echo_server() -> (SocketAddr, mpsc::UnboundedReceiver<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let closed = closed_tx.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = closed.send(());
            });
        }
    });

    (addr, closed_rx)
}

/// Server writing `payload` to every connection and then closing it
pub async fn writing_server(payload: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let payload = Arc::new(payload);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let payload = payload.clone();
            tokio::spawn(async move {
                let _ = socket.write_all(&payload).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    addr
}

/// Server reading and discarding everything it receives
pub async fn draining_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// A loopback address nothing listens on
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
