use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::{SinkExt, StreamExt};
use groupcall_core::{ChannelError, ClientFrame, RelayEvent, ServerFrame, SignalingChannel};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

enum Outgoing {
    Text(String),
    Close,
}

/// Relay connection over a websocket carrying JSON text frames.
pub struct WebSocketChannel {
    url: Url,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    connected: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WebSocketChannel {
    pub async fn connect(relay_url: &str) -> Result<Self, ChannelError> {
        let url = websocket_url(relay_url)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| ChannelError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(url = %url, "relay websocket connected");
        let (mut ws_write, mut ws_read) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Outgoing>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<RelayEvent>();
        let connected = Arc::new(AtomicBool::new(true));

        let writer_connected = Arc::clone(&connected);
        let writer = tokio::spawn(async move {
            while let Some(item) = outgoing_rx.recv().await {
                match item {
                    Outgoing::Text(text) => {
                        tracing::trace!(event = "ws_out", len = text.len());
                        if ws_write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Outgoing::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            writer_connected.store(false, Ordering::SeqCst);
        });

        let reader_connected = Arc::clone(&connected);
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::debug!("skipping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                                tracing::debug!("relay websocket closed: {err}");
                            }
                            _ => tracing::warn!("relay websocket error: {err}"),
                        }
                        break;
                    }
                };
                tracing::trace!(event = "ws_in", len = text.len());
                match ServerFrame::decode(&text) {
                    Ok(frame) => {
                        if events_tx.send(RelayEvent::from(frame)).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "skipping unparseable relay frame"),
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        });

        Ok(Self {
            url,
            outgoing,
            events: Mutex::new(Some(events_rx)),
            connected,
            tasks: Mutex::new(vec![writer, reader]),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl SignalingChannel for WebSocketChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        if !self.is_connected() {
            return Err(ChannelError::Closed);
        }
        let text = frame.encode()?;
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    fn events(&self) -> Result<mpsc::UnboundedReceiver<RelayEvent>, ChannelError> {
        self.events.lock().take().ok_or(ChannelError::EventsTaken)
    }

    fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.outgoing.send(Outgoing::Close);
        // The writer exits on its own after the close frame.
        let mut tasks = self.tasks.lock();
        if let Some(reader) = tasks.pop() {
            reader.abort();
        }
        tasks.clear();
        tracing::debug!(url = %self.url, "relay websocket disconnected");
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Websocket address for a relay given as `ws(s)://` or `http(s)://`.
pub fn websocket_url(relay_url: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(relay_url)
        .map_err(|err| ChannelError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(ChannelError::Setup(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChannelError::Setup("invalid websocket scheme".into()))?;
    url.set_fragment(None);
    Ok(url)
}
