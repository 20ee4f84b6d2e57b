use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{AppError, Result};

/// Raw duplex text stream. No protocol knowledge lives here.
#[async_trait]
pub trait FeedTransport: Send {
    async fn connect(&mut self, url: &str) -> Result<()>;

    async fn send(&mut self, text: String) -> Result<()>;

    /// Next text frame; `Ok(None)` when the peer closed the stream.
    /// Must be cancel-safe: it is polled inside `select!`.
    async fn recv(&mut self) -> Result<Option<String>>;

    async fn close(&mut self) -> Result<()>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
pub struct TungsteniteTransport {
    stream: Option<WsStream>,
}

impl TungsteniteTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn stream(&mut self) -> Result<&mut WsStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| AppError::Feed("transport not connected".into()))
    }
}

#[async_trait]
impl FeedTransport for TungsteniteTransport {
    async fn connect(&mut self, url: &str) -> Result<()> {
        let (ws_stream, _) = connect_async(url).await?;
        self.stream = Some(ws_stream);
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<()> {
        self.stream()?.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            let msg = self.stream()?.next().await;
            match msg {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Ok(Some(text)),
                    Err(_) => debug!("WS binary frame is not UTF-8, skipped"),
                },
                Some(Ok(Message::Ping(data))) => {
                    // Queued pong; flushed with the next read or write.
                    debug!(len = data.len(), "WS transport ping");
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.stream = None;
                    return Ok(None);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.stream = None;
                    return Err(e.into());
                }
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.close(None).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub use scripted::{ScriptedHandle, ScriptedTransport};

#[cfg(test)]
mod scripted {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::*;

    /// Shared view of what the session did with a [`ScriptedTransport`].
    #[derive(Default)]
    pub struct ScriptedState {
        pub sent: Vec<String>,
        pub connects: usize,
        pub closes: usize,
        /// Results for successive `connect` calls; empty means success.
        pub connect_results: VecDeque<bool>,
    }

    #[derive(Clone)]
    pub struct ScriptedHandle {
        pub state: Arc<Mutex<ScriptedState>>,
        inbound: mpsc::UnboundedSender<Option<String>>,
    }

    impl ScriptedHandle {
        /// Queue a text frame for the session to receive.
        pub fn push(&self, text: &str) {
            let _ = self.inbound.send(Some(text.to_string()));
        }

        /// Simulate the peer closing the connection.
        pub fn drop_connection(&self) {
            let _ = self.inbound.send(None);
        }

        pub fn sent(&self) -> Vec<String> {
            self.state.lock().map(|s| s.sent.clone()).unwrap_or_default()
        }

        pub fn connects(&self) -> usize {
            self.state.lock().map(|s| s.connects).unwrap_or(0)
        }

        pub fn fail_next_connects(&self, n: usize) {
            if let Ok(mut s) = self.state.lock() {
                s.connect_results.extend(std::iter::repeat(false).take(n));
            }
        }
    }

    /// In-memory transport driven by a [`ScriptedHandle`].
    pub struct ScriptedTransport {
        state: Arc<Mutex<ScriptedState>>,
        inbound: mpsc::UnboundedReceiver<Option<String>>,
    }

    impl ScriptedTransport {
        pub fn new() -> (Self, ScriptedHandle) {
            let (tx, rx) = mpsc::unbounded_channel();
            let state = Arc::new(Mutex::new(ScriptedState::default()));
            (
                Self { state: state.clone(), inbound: rx },
                ScriptedHandle { state, inbound: tx },
            )
        }
    }

    #[async_trait]
    impl FeedTransport for ScriptedTransport {
        async fn connect(&mut self, _url: &str) -> Result<()> {
            let ok = {
                let mut s = self
                    .state
                    .lock()
                    .map_err(|_| AppError::Feed("scripted state poisoned".into()))?;
                s.connects += 1;
                s.connect_results.pop_front().unwrap_or(true)
            };
            if ok {
                Ok(())
            } else {
                Err(AppError::Feed("scripted connect failure".into()))
            }
        }

        async fn send(&mut self, text: String) -> Result<()> {
            if let Ok(mut s) = self.state.lock() {
                s.sent.push(text);
            }
            Ok(())
        }

        async fn recv(&mut self) -> Result<Option<String>> {
            match self.inbound.recv().await {
                Some(frame) => Ok(frame),
                None => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<()> {
            if let Ok(mut s) = self.state.lock() {
                s.closes += 1;
            }
            Ok(())
        }
    }
}
