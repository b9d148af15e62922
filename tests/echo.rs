//! End-to-end scenario tests driven over real loopback TCP, not a mocked
//! transport — a `bcp::serve` listener and a `bcp::connect` client talking
//! over `127.0.0.1:0`. Covers spec.md section 8 scenario 1 (single
//! connection echo) and the graceful shutdown handshake; the harder
//! multi-connection/retransmission/ghost-connection scenarios are exercised
//! at the `SessionState` level in `src/session/state.rs`'s unit tests, where
//! connection loss and duplicate delivery can be injected directly instead
//! of raced over real sockets.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing_test::traced_test;

use bcp::{Config, PayloadCodec, SessionCallbacks, SessionHandle, SessionId};

/// records every `received` message and `shut_down`/`interrupted` firing
/// onto channels a test can poll, and (if told to) echoes messages straight
/// back on the same session.
struct RecordingCallbacks {
    received_tx: mpsc::UnboundedSender<Vec<Vec<u8>>>,
    shut_down_tx: mpsc::UnboundedSender<()>,
    handle: OnceLock<SessionHandle>,
    echo: bool,
}

impl RecordingCallbacks {
    fn new(echo: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<Vec<u8>>>, mpsc::UnboundedReceiver<()>) {
        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (shut_down_tx, shut_down_rx) = mpsc::unbounded_channel();
        let callbacks = Arc::new(Self {
            received_tx,
            shut_down_tx,
            handle: OnceLock::new(),
            echo,
        });
        (callbacks, received_rx, shut_down_rx)
    }
}

#[async_trait]
impl SessionCallbacks for RecordingCallbacks {
    async fn received(&self, message: Vec<Vec<u8>>) {
        if self.echo {
            if let Some(handle) = self.handle.get() {
                handle.send(message.clone()).await;
            }
        }
        let _ = self.received_tx.send(message);
    }

    async fn attach_handle(&self, handle: SessionHandle) {
        let _ = self.handle.set(handle);
    }

    async fn shut_down(&self) {
        let _ = self.shut_down_tx.send(());
    }

    async fn interrupted(&self) {
        let _ = self.shut_down_tx.send(());
    }
}

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(Config::default());
    tokio::spawn(async move {
        let _ = bcp::serve(
            listener,
            config,
            Arc::new(|_session_id: SessionId, _peer: SocketAddr| {
                let (callbacks, _received_rx, _shut_down_rx) = RecordingCallbacks::new(true);
                callbacks as Arc<dyn SessionCallbacks>
            }),
        )
        .await;
    });
    addr
}

async fn recv_within(rx: &mut mpsc::UnboundedReceiver<Vec<Vec<u8>>>, timeout: Duration) -> Vec<Vec<u8>> {
    tokio::time::timeout(timeout, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed before a message arrived")
}

#[tokio::test]
#[traced_test]
async fn single_connection_echo_round_trips_messages_in_order() {
    let addr = start_echo_server().await;

    let (callbacks, mut received_rx, _shut_down_rx) = RecordingCallbacks::new(false);
    let handle = bcp::connect(addr, Arc::new(Config::default()), callbacks)
        .await
        .expect("client connect");

    handle.send(vec![b"hi".to_vec()]).await;
    handle.send(vec![b"world".to_vec()]).await;

    let first = recv_within(&mut received_rx, Duration::from_secs(2)).await;
    let second = recv_within(&mut received_rx, Duration::from_secs(2)).await;
    assert_eq!(first, vec![b"hi".to_vec()]);
    assert_eq!(second, vec![b"world".to_vec()]);
}

#[tokio::test]
#[traced_test]
async fn multi_buffer_messages_survive_the_round_trip_intact() {
    let addr = start_echo_server().await;

    let (callbacks, mut received_rx, _shut_down_rx) = RecordingCallbacks::new(false);
    let handle = bcp::connect(addr, Arc::new(Config::default()), callbacks)
        .await
        .expect("client connect");

    handle.send(vec![b"part-a".to_vec(), b"part-b".to_vec()]).await;
    let message = recv_within(&mut received_rx, Duration::from_secs(2)).await;
    assert_eq!(message, vec![b"part-a".to_vec(), b"part-b".to_vec()]);
}

#[tokio::test]
#[traced_test]
async fn graceful_shutdown_drains_and_fires_shut_down() {
    let addr = start_echo_server().await;

    let (callbacks, _received_rx, mut shut_down_rx) = RecordingCallbacks::new(false);
    let handle = bcp::connect(addr, Arc::new(Config::default()), callbacks)
        .await
        .expect("client connect");

    handle.send(vec![b"ping".to_vec()]).await;
    handle.shut_down().await;
    handle.closed().await;

    assert!(tokio::time::timeout(Duration::from_secs(2), shut_down_rx.recv())
        .await
        .expect("timed out waiting for shut_down")
        .is_some());
}

/// a trivial, symmetric payload codec: XORs every byte with a fixed key.
/// Applying it on both ends of a connection round-trips cleanly, the same
/// way a real encryption hook would.
struct XorCodec(u8);

impl PayloadCodec for XorCodec {
    fn encode(&self, buffers: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        buffers
            .into_iter()
            .map(|b| b.into_iter().map(|byte| byte ^ self.0).collect())
            .collect()
    }

    fn decode(&self, buffers: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        self.encode(buffers)
    }
}

#[tokio::test]
#[traced_test]
async fn payload_codec_transforms_buffers_symmetrically_on_both_ends() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = Arc::new(Config::default());
    tokio::spawn(async move {
        let _ = bcp::serve_with_codec(
            listener,
            config,
            Arc::new(|_session_id: SessionId, _peer: SocketAddr| {
                let (callbacks, _received_rx, _shut_down_rx) = RecordingCallbacks::new(true);
                callbacks as Arc<dyn SessionCallbacks>
            }),
            Arc::new(XorCodec(0x42)),
        )
        .await;
    });

    let (callbacks, mut received_rx, _shut_down_rx) = RecordingCallbacks::new(false);
    let handle = bcp::connect_with_codec(
        addr,
        Arc::new(Config::default()),
        callbacks,
        Arc::new(XorCodec(0x42)),
    )
    .await
    .expect("client connect");

    handle.send(vec![b"secret".to_vec()]).await;
    let message = recv_within(&mut received_rx, Duration::from_secs(2)).await;
    assert_eq!(message, vec![b"secret".to_vec()]);
}

#[tokio::test]
#[traced_test]
async fn resume_establishes_a_fresh_session_under_a_given_id() {
    let addr = start_echo_server().await;
    let session_id = SessionId::new_random();

    let (callbacks, mut received_rx, _shut_down_rx) = RecordingCallbacks::new(false);
    let handle = bcp::resume(addr, session_id, Arc::new(Config::default()), callbacks)
        .await
        .expect("client resume");
    assert_eq!(handle.session_id(), session_id);

    handle.send(vec![b"resumed".to_vec()]).await;
    let message = recv_within(&mut received_rx, Duration::from_secs(2)).await;
    assert_eq!(message, vec![b"resumed".to_vec()]);
}
