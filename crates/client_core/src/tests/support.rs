//! Channel-backed fakes shared by the client_core test modules.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::Duration;

use async_trait::async_trait;
use shared::protocol::Envelope;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use crate::transport::{WireConnector, WireSocket};

/// In-memory stand-in for the WebSocket: records every frame the client
/// sends and lets tests inject server frames or drop the live socket.
pub struct FakeWire {
    sent_tx: mpsc::UnboundedSender<String>,
    sent_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    current: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    connect_count: AtomicUsize,
}

impl FakeWire {
    pub fn new() -> Arc<Self> {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            sent_tx,
            sent_rx: Mutex::new(sent_rx),
            current: StdMutex::new(None),
            connect_count: AtomicUsize::new(0),
        })
    }

    /// Next client-to-server frame, bounded so a broken test fails instead
    /// of hanging.
    pub async fn expect_sent(&self) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            self.sent_rx.lock().await.recv().await
        })
        .await
        .expect("timed out waiting for a sent frame")
        .expect("transport dropped its send channel")
    }

    pub async fn expect_sent_envelope(&self) -> Envelope {
        let frame = self.expect_sent().await;
        serde_json::from_str(&frame).expect("sent frame is a valid envelope")
    }

    /// Non-blocking: whether any unobserved sent frame exists.
    pub async fn try_next_sent(&self) -> Option<String> {
        self.sent_rx.lock().await.try_recv().ok()
    }

    /// Injects a server-to-client frame into the live socket.
    pub fn inject(&self, frame: String) {
        let current = self.current.lock().expect("fake wire lock");
        if let Some(tx) = current.as_ref() {
            let _ = tx.send(frame);
        }
    }

    pub fn inject_envelope(&self, envelope: &Envelope) {
        self.inject(serde_json::to_string(envelope).expect("encode envelope"));
    }

    /// Drops the live socket, as if the server closed the connection.
    pub fn close_socket(&self) {
        *self.current.lock().expect("fake wire lock") = None;
    }

    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub async fn wait_for_connects(&self, at_least: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.connect_count() < at_least {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for socket connects");
    }
}

#[async_trait]
impl WireConnector for FakeWire {
    async fn connect(&self, _url: &Url) -> anyhow::Result<Box<dyn WireSocket>> {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        *self.current.lock().expect("fake wire lock") = Some(inject_tx);
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSocket {
            sent: self.sent_tx.clone(),
            inject: inject_rx,
        }))
    }
}

struct FakeSocket {
    sent: mpsc::UnboundedSender<String>,
    inject: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl WireSocket for FakeSocket {
    async fn send(&mut self, frame: String) -> anyhow::Result<()> {
        let _ = self.sent.send(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<anyhow::Result<String>> {
        self.inject.recv().await.map(Ok)
    }
}

pub fn test_ws_url() -> Url {
    Url::parse("ws://127.0.0.1:1/ws").expect("static url")
}
