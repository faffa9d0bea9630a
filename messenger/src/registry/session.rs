use std::collections::VecDeque;
use std::time::Duration;

use sipchat_messaging::{ComposingState, Message};
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::events::SessionKey;
use crate::outgoing::OutgoingMessage;
use crate::stream::MessageStream;
use crate::transport::Route;

pub(super) enum Payload {
    /// Waiting for the crypto pool job with this id.
    Pending(u64),
    Ready(Vec<u8>),
}

pub(super) struct Queued {
    pub message: OutgoingMessage,
    pub payload: Payload,
}

/// One conversation. Owned by the network runtime; never shared.
pub(super) struct PeerSession {
    pub key: SessionKey,
    pub routes: Vec<Route>,
    pub lookup: Option<(u64, AbortHandle)>,
    pub stream: MessageStream,
    pub outbox: VecDeque<Queued>,
    pub composing_until: Option<Instant>,
    /// PGP messages that arrived before the account had a private key.
    pub held: Vec<Message>,
    pub public_key_sent: bool,
}

impl PeerSession {
    pub fn new(key: SessionKey, stream: MessageStream) -> Self {
        Self {
            key,
            routes: Vec::new(),
            lookup: None,
            stream,
            outbox: VecDeque::new(),
            composing_until: None,
            held: Vec::new(),
            public_key_sent: false,
        }
    }

    pub fn enqueue(&mut self, message: OutgoingMessage, payload: Vec<u8>) {
        self.outbox.push_back(Queued {
            message,
            payload: Payload::Ready(payload),
        });
    }

    pub fn enqueue_front(&mut self, message: OutgoingMessage, payload: Vec<u8>) {
        self.outbox.push_front(Queued {
            message,
            payload: Payload::Ready(payload),
        });
    }

    pub fn enqueue_pending(&mut self, message: OutgoingMessage, job: u64) {
        self.outbox.push_back(Queued {
            message,
            payload: Payload::Pending(job),
        });
    }

    /// Settle an encryption job: fill in the payload, or drop the entry when it failed.
    pub fn resolve(&mut self, job: u64, payload: Option<Vec<u8>>) -> Option<OutgoingMessage> {
        let index = self
            .outbox
            .iter()
            .position(|q| matches!(q.payload, Payload::Pending(id) if id == job))?;
        match payload {
            Some(bytes) => {
                let queued = &mut self.outbox[index];
                queued.payload = Payload::Ready(bytes);
                Some(queued.message.clone())
            }
            None => self.outbox.remove(index).map(|q| q.message),
        }
    }

    /// Pop the head of the outbox if it is ready to go.
    pub fn next_ready(&mut self) -> Option<(OutgoingMessage, Vec<u8>)> {
        if !matches!(self.outbox.front()?.payload, Payload::Ready(_)) {
            return None;
        }
        match self.outbox.pop_front()? {
            Queued {
                message,
                payload: Payload::Ready(bytes),
            } => Some((message, bytes)),
            Queued { .. } => None,
        }
    }

    pub fn lookup_in_flight(&self) -> bool {
        self.lookup.is_some()
    }

    pub fn abort_lookup(&mut self) {
        if let Some((_, handle)) = self.lookup.take() {
            handle.abort();
        }
    }

    pub fn set_composing(&mut self, state: ComposingState, refresh: u32) {
        self.composing_until = match state {
            ComposingState::Active => Some(Instant::now() + Duration::from_secs(u64::from(refresh))),
            ComposingState::Idle => None,
        };
    }

    pub fn is_composing(&self) -> bool {
        self.composing_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}
