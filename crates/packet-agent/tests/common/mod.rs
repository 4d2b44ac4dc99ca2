//! Shared fixtures: an in-process control server, relay peers and targets
#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use packet_agent::{
    Agent, AgentOptions, ControlEndpoint, HeartbeatConfig, ReconnectConfig, SessionState,
};
use packet_proto::{codec, ControlCodec, ControlMessage, RelayBind};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("packet_agent=debug")
        .with_test_writer()
        .try_init();
}

/// How the mock control server treats new connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Welcome the agent and answer pings
    Welcome,
    /// Reply Rejected to the Hello
    Reject,
    /// Accept the TCP connection and drop it immediately
    CloseImmediately,
    /// Welcome the agent, then never send anything again
    Silent,
}

/// Plain-TCP control server speaking the real codec
pub struct MockControlServer {
    pub addr: String,
    accepts: Arc<AtomicUsize>,
    mode: Arc<Mutex<Mode>>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<ControlMessage>>,
    task: JoinHandle<()>,
}

impl MockControlServer {
    pub async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accepts = Arc::new(AtomicUsize::new(0));
        let mode = Arc::new(Mutex::new(mode));
        let outbound: Arc<Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>> =
            Arc::new(Mutex::new(None));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let task = {
            let accepts = accepts.clone();
            let mode = mode.clone();
            let outbound = outbound.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    let session = accepts.fetch_add(1, Ordering::SeqCst) + 1;
                    let mode = *mode.lock().unwrap();
                    if mode == Mode::CloseImmediately {
                        drop(socket);
                        continue;
                    }
                    tokio::spawn(serve(
                        socket,
                        mode,
                        session,
                        inbound_tx.clone(),
                        outbound.clone(),
                    ));
                }
            })
        };

        Self {
            addr,
            accepts,
            mode,
            outbound,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            task,
        }
    }

    /// Number of TCP connections accepted so far
    pub fn accepts(&self) -> usize {
        self.accepts.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Send a frame to the most recently welcomed agent session
    pub fn send(&self, message: ControlMessage) {
        let outbound = self.outbound.lock().unwrap();
        outbound
            .as_ref()
            .expect("no agent session")
            .send(message)
            .expect("agent session closed");
    }

    /// Next frame from the agent matching `predicate` (pings are skipped)
    pub async fn recv_matching<F>(&self, mut predicate: F) -> ControlMessage
    where
        F: FnMut(&ControlMessage) -> bool,
    {
        let mut inbound = self.inbound.lock().await;
        tokio::time::timeout(WAIT, async {
            loop {
                let message = inbound.recv().await.expect("mock server closed");
                if predicate(&message) {
                    return message;
                }
            }
        })
        .await
        .expect("timed out waiting for agent message")
    }

    pub async fn wait_for_accepts(&self, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.accepts() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for connections");
    }
}

impl Drop for MockControlServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    socket: TcpStream,
    mode: Mode,
    session: usize,
    inbound: mpsc::UnboundedSender<ControlMessage>,
    outbound_slot: Arc<Mutex<Option<mpsc::UnboundedSender<ControlMessage>>>>,
) {
    let mut framed = Framed::new(socket, ControlCodec::<ControlMessage>::new());

    match framed.next().await {
        Some(Ok(hello @ ControlMessage::Hello { .. })) => {
            let _ = inbound.send(hello);
        }
        _ => return,
    }

    if mode == Mode::Reject {
        let _ = framed
            .send(ControlMessage::Rejected {
                reason: "unknown app key".to_string(),
            })
            .await;
        return;
    }

    // Installed before Welcome so tests can send as soon as the agent runs
    let (tx, mut rx) = mpsc::unbounded_channel();
    *outbound_slot.lock().unwrap() = Some(tx);

    if framed
        .send(ControlMessage::Welcome {
            session_id: format!("session-{}", session),
            heartbeat_interval_ms: 0,
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(message) => {
                    if framed.send(message).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = framed.next() => match frame {
                Some(Ok(ControlMessage::Ping { timestamp })) => {
                    if mode != Mode::Silent
                        && framed.send(ControlMessage::Pong { timestamp }).await.is_err()
                    {
                        break;
                    }
                }
                Some(Ok(ControlMessage::Disconnect { reason })) => {
                    let _ = inbound.send(ControlMessage::Disconnect { reason });
                    let _ = framed.send(ControlMessage::DisconnectAck).await;
                    break;
                }
                Some(Ok(message)) => {
                    let _ = inbound.send(message);
                }
                _ => break,
            },
        }
    }
}

/// Relay peer endpoint: accepts agent connections and reads the bind preamble
pub struct PeerEndpoint {
    pub addr: String,
    binds: tokio::sync::Mutex<mpsc::UnboundedReceiver<(RelayBind, TcpStream)>>,
    task: JoinHandle<()>,
}

impl PeerEndpoint {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut len = [0u8; 4];
                    if socket.read_exact(&mut len).await.is_err() {
                        return;
                    }
                    let mut frame = vec![0u8; u32::from_be_bytes(len) as usize];
                    if socket.read_exact(&mut frame).await.is_err() {
                        return;
                    }
                    let mut buf = bytes::BytesMut::new();
                    buf.extend_from_slice(&len);
                    buf.extend_from_slice(&frame);
                    if let Ok(Some(bind)) = codec::decode_frame::<RelayBind>(&mut buf) {
                        let _ = tx.send((bind, socket));
                    }
                });
            }
        });

        Self {
            addr,
            binds: tokio::sync::Mutex::new(rx),
            task,
        }
    }

    /// Next bound relay connection
    pub async fn accept(&self) -> (RelayBind, TcpStream) {
        let mut binds = self.binds.lock().await;
        tokio::time::timeout(WAIT, binds.recv())
            .await
            .expect("timed out waiting for relay connection")
            .expect("peer endpoint closed")
    }
}

impl Drop for PeerEndpoint {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Upstream target that echoes everything back
pub async fn echo_target() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let task = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
                let _ = writer.shutdown().await;
            });
        }
    });
    (addr, task)
}

/// Upstream target that swallows input and counts the bytes
pub async fn sink_target() -> (String, Arc<AtomicU64>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    let task = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    counter.fetch_add(n as u64, Ordering::SeqCst);
                }
            });
        }
    });
    (addr, received, task)
}

/// Upstream target that streams `blob` bytes back while counting what it
/// receives
pub async fn chatty_target(blob: usize) -> (String, Arc<AtomicU64>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let received = Arc::new(AtomicU64::new(0));
    let counter = received.clone();
    let task = tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let counter = counter.clone();
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.into_split();
                tokio::spawn(async move {
                    let _ = writer.write_all(&vec![0xd0; blob]).await;
                });
                let mut buf = vec![0u8; 4096];
                while let Ok(n) = reader.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    counter.fetch_add(n as u64, Ordering::SeqCst);
                }
            });
        }
    });
    (addr, received, task)
}

/// An address nothing listens on
pub async fn closed_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

/// Fast timings against a plain-TCP control server
pub fn test_options(control: &str) -> AgentOptions {
    AgentOptions::builder()
        .control_endpoint(ControlEndpoint::plain(control))
        .connect_timeout(Duration::from_secs(1))
        .handshake_timeout(Duration::from_secs(1))
        .reconnect(ReconnectConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
            jitter: 0.0,
            max_retries: 3,
        })
        .heartbeat(HeartbeatConfig {
            interval: Duration::from_secs(5),
            miss_threshold: 3,
        })
        .shutdown_grace(Duration::from_secs(2))
        .build()
}

/// Records every status event delivered to the listener
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<(i32, String)>>>,
}

impl EventRecorder {
    pub fn install(agent: &Agent) -> Self {
        let recorder = Self::default();
        let sink = recorder.events.clone();
        agent.set_status_listener(move |code: i32, message: &str| {
            sink.lock().unwrap().push((code, message.to_string()));
        });
        recorder
    }

    pub fn events(&self) -> Vec<(i32, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn codes(&self) -> Vec<i32> {
        self.events().into_iter().map(|(code, _)| code).collect()
    }

    pub fn count(&self, code: i32) -> usize {
        self.codes().into_iter().filter(|c| *c == code).count()
    }

    pub async fn wait_for(&self, code: i32) {
        self.wait_for_count(code, 1).await;
    }

    pub async fn wait_for_count(&self, code: i32, count: usize) {
        tokio::time::timeout(WAIT, async {
            while self.count(code) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {} x code {}: {:?}", count, code, self.events()));
    }
}

pub async fn wait_for_state(agent: &Agent, state: SessionState) {
    let mut watcher = agent.subscribe_state();
    tokio::time::timeout(WAIT, watcher.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}, agent is {}", state, agent.state()))
        .expect("state channel closed");
}

/// Initialized and Running against `server`
pub async fn running_agent(server: &MockControlServer) -> (Agent, EventRecorder) {
    init_tracing();
    let agent = Agent::new();
    let recorder = EventRecorder::install(&agent);
    agent
        .initialize("test-app-key", test_options(&server.addr))
        .unwrap();
    agent.start().unwrap();
    wait_for_state(&agent, SessionState::Running).await;
    (agent, recorder)
}
