use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{ChannelError, ClientFrame, RelayEvent, SignalingChannel};
use crate::envelope::Envelope;

struct MockChannelState {
    connected: bool,
    disconnected: bool,
    failing: bool,
    sent: Vec<ClientFrame>,
    inject: Option<mpsc::UnboundedSender<RelayEvent>>,
    events: Option<mpsc::UnboundedReceiver<RelayEvent>>,
}

/// Signaling channel that records outbound frames and lets tests inject
/// relay events.
#[derive(Clone)]
pub struct MockChannel {
    state: Arc<Mutex<MockChannelState>>,
}

impl MockChannel {
    pub fn new() -> Self {
        let (inject, events) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(MockChannelState {
                connected: true,
                disconnected: false,
                failing: false,
                sent: Vec::new(),
                inject: Some(inject),
                events: Some(events),
            })),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Make every send fail while the channel still reports connected.
    pub fn fail_sends(&self, failing: bool) {
        self.state.lock().failing = failing;
    }

    /// No-op once disconnected; the event stream has ended by then.
    pub fn inject(&self, event: RelayEvent) {
        if let Some(inject) = &self.state.lock().inject {
            let _ = inject.send(event);
        }
    }

    pub fn sent(&self) -> Vec<ClientFrame> {
        self.state.lock().sent.clone()
    }

    pub fn take_sent(&self) -> Vec<ClientFrame> {
        std::mem::take(&mut self.state.lock().sent)
    }

    /// Outbound `message` frames decoded back into envelopes.
    pub fn sent_envelopes(&self) -> Vec<Envelope> {
        self.state
            .lock()
            .sent
            .iter()
            .filter_map(|frame| match frame {
                ClientFrame::Message(value) => Envelope::decode(value.clone()).ok(),
                _ => None,
            })
            .collect()
    }

    pub fn was_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingChannel for MockChannel {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn send(&self, frame: ClientFrame) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(ChannelError::Closed);
        }
        if state.failing {
            return Err(ChannelError::Encode("send refused".into()));
        }
        state.sent.push(frame);
        Ok(())
    }

    fn events(&self) -> Result<mpsc::UnboundedReceiver<RelayEvent>, ChannelError> {
        self.state.lock().events.take().ok_or(ChannelError::EventsTaken)
    }

    fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.disconnected = true;
        state.inject = None;
    }
}
