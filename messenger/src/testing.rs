//! In-process doubles for the SIP stack and resolver, for wiring registries together
//! in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;
use sipchat_crypto_core::otr::{InputOutcome, OtrContext, OtrHost, OtrIdentity};
use sipchat_crypto_core::{Fingerprint, OtrError, OtrSession, OtrState, SmpStatus};
use sipchat_messaging::SipUri;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

use crate::events::MessagingEvent;
use crate::stream::OtrFactory;
use crate::transport::{
    DnsResolver, InboundSink, IncomingSipMessage, LookupError, Route, SipFailure,
    SipMessageRequest, SipMessageTransport, SipResponse,
};

/// Delivers every request straight into the sink registered for its request URI.
#[derive(Default)]
pub struct LoopbackTransport {
    sinks: Mutex<HashMap<String, InboundSink>>,
    sent: Mutex<Vec<SipMessageRequest>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, address: &str, sink: InboundSink) {
        self.sinks.lock().insert(address.to_ascii_lowercase(), sink);
    }

    pub fn unregister(&self, address: &str) {
        self.sinks.lock().remove(&address.to_ascii_lowercase());
    }

    /// Every request handed to the transport, in order.
    pub fn sent(&self) -> Vec<SipMessageRequest> {
        self.sent.lock().clone()
    }
}

impl SipMessageTransport for LoopbackTransport {
    fn send(&self, request: SipMessageRequest) -> BoxFuture<'static, Result<SipResponse, SipFailure>> {
        self.sent.lock().push(request.clone());
        let address = request.request_uri.address().to_ascii_lowercase();
        let sink = self.sinks.lock().get(&address).cloned();

        let result = match sink {
            Some(sink) => {
                let delivered = sink.deliver(IncomingSipMessage {
                    request_uri: request.request_uri,
                    from: request.from,
                    to: request.to,
                    content_type: request.content_type,
                    headers: request.extra_headers,
                    body: request.body,
                });
                if delivered {
                    Ok(SipResponse {
                        code: 200,
                        reason: "OK".to_string(),
                    })
                } else {
                    Err(SipFailure::new(Some(480), "Temporarily Unavailable"))
                }
            }
            None => Err(SipFailure::new(Some(404), "Not Found")),
        };
        Box::pin(future::ready(result))
    }
}

/// Resolves every URI to itself over the first configured transport.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    fail: bool,
}

impl StaticResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self { fail: true })
    }
}

#[async_trait]
impl DnsResolver for StaticResolver {
    async fn lookup_sip_proxy(
        &self,
        uri: &SipUri,
        transports: &[String],
        _tls_name: Option<&str>,
    ) -> Result<Vec<Route>, LookupError> {
        if self.fail {
            return Err(LookupError(format!("no SIP records for {uri}")));
        }
        let transport = transports.first().map(String::as_str).unwrap_or("udp");
        Ok(vec![Route::new(uri.clone(), transport)])
    }
}

/// OTR engine that can be told to start leaking cleartext, as a compromised or
/// buggy peer library would.
#[derive(Debug, Default, Clone)]
pub struct DowngradeSwitch {
    tripped: Arc<AtomicBool>,
}

impl DowngradeSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
    }
}

impl OtrFactory for DowngradeSwitch {
    fn create(&self, identity: OtrIdentity, host: Arc<dyn OtrHost>) -> Box<dyn OtrSession> {
        Box::new(Switched {
            inner: OtrContext::new(identity, host),
            tripped: self.tripped.clone(),
        })
    }
}

struct Switched {
    inner: OtrContext,
    tripped: Arc<AtomicBool>,
}

impl OtrSession for Switched {
    fn handle_input(&mut self, body: &[u8], content_type: &str) -> Result<InputOutcome, OtrError> {
        self.inner.handle_input(body, content_type)
    }

    fn handle_output(&mut self, content: &[u8], content_type: &str) -> Result<Vec<u8>, OtrError> {
        if self.tripped.load(Ordering::SeqCst) {
            return Ok(content.to_vec());
        }
        self.inner.handle_output(content, content_type)
    }

    fn start(&mut self) {
        self.inner.start()
    }

    fn stop(&mut self) {
        self.inner.stop()
    }

    fn smp_start(&mut self, secret: &[u8]) -> Result<(), OtrError> {
        self.inner.smp_start(secret)
    }

    fn smp_respond(&mut self, secret: &[u8]) -> Result<(), OtrError> {
        self.inner.smp_respond(secret)
    }

    fn smp_abort(&mut self) {
        self.inner.smp_abort()
    }

    fn state(&self) -> OtrState {
        self.inner.state()
    }

    fn smp_status(&self) -> SmpStatus {
        self.inner.smp_status()
    }

    fn local_fingerprint(&self) -> Fingerprint {
        self.inner.local_fingerprint()
    }

    fn peer_fingerprint(&self) -> Option<Fingerprint> {
        self.inner.peer_fingerprint()
    }

    fn peer_verified(&self) -> bool {
        self.inner.peer_verified()
    }
}

/// Wait for the first event matching `predicate`, skipping everything else.
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<MessagingEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<MessagingEvent>
where
    F: FnMut(&MessagingEvent) -> bool,
{
    let search = async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event receiver lagged");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(timeout, search).await.ok().flatten()
}

/// Everything already queued on the receiver.
pub fn drain_events(rx: &mut broadcast::Receiver<MessagingEvent>) -> Vec<MessagingEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
        }
    }
}
