use std::sync::Arc;
use std::time::Duration;

use sipchat_crypto_core::{KeyAlgorithm, KeyStore, OtrState};
use sipchat_messaging::{
    content_types, ComposingState, CpimCodec, IsComposingDocument, NotificationStatus, SipUri,
};
use sipchat_messenger::stream::OtrFactory;
use sipchat_messenger::testing::{wait_for_event, DowngradeSwitch, LoopbackTransport, StaticResolver};
use sipchat_messenger::{
    AccountIdentity, IncomingSipMessage, MessageSettings, MessagingEvent, MessengerConfig,
    MessengerError, OutgoingRequest, SessionRegistry, SipMessageRequest,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(30);

struct Peer {
    registry: SessionRegistry,
    events: broadcast::Receiver<MessagingEvent>,
    account: AccountIdentity,
    _keys: TempDir,
}

impl Peer {
    fn id(&self) -> &str {
        &self.account.id
    }

    fn uri(&self) -> &SipUri {
        &self.account.uri
    }
}

fn start_peer(
    transport: &Arc<LoopbackTransport>,
    uri: &str,
    name: &str,
    configure: impl FnOnce(&mut MessageSettings),
    otr: Option<Arc<dyn OtrFactory>>,
) -> Peer {
    let keys = TempDir::new().unwrap();
    let config = MessengerConfig {
        keys_dir: keys.path().to_path_buf(),
        crypto_workers: 2,
        key_algorithm: KeyAlgorithm::Cv25519,
        ..MessengerConfig::default()
    };
    let mut account = AccountIdentity::new(SipUri::parse(uri).unwrap(), Some(name));
    configure(&mut account.message_settings);

    let mut builder = SessionRegistry::builder(config, transport.clone(), StaticResolver::new())
        .account(account.clone());
    if let Some(factory) = otr {
        builder = builder.otr_factory(factory);
    }
    let registry = builder.start();
    transport.register(&account.id, registry.inbound_sink());
    let events = registry.subscribe();
    Peer {
        registry,
        events,
        account,
        _keys: keys,
    }
}

fn sent_between(transport: &LoopbackTransport, from: &Peer, to: &Peer) -> Vec<SipMessageRequest> {
    transport
        .sent()
        .into_iter()
        .filter(|r| r.from.uri.address() == from.id() && r.request_uri.address() == to.id())
        .collect()
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

async fn received(peer: &mut Peer) -> sipchat_messaging::Message {
    match wait_for_event(&mut peer.events, WAIT, |e| {
        matches!(e, MessagingEvent::MessageReceived { .. })
    })
    .await
    {
        Some(MessagingEvent::MessageReceived { message, .. }) => message,
        other => panic!("{} received nothing: {other:?}", peer.id()),
    }
}

async fn otr_state(peer: &mut Peer, wanted: OtrState) {
    let reached = wait_for_event(&mut peer.events, WAIT, |e| {
        matches!(e, MessagingEvent::OtrStateChanged { state, .. } if *state == wanted)
    })
    .await;
    assert!(reached.is_some(), "{} never reached {wanted}", peer.id());
}

async fn otr_handshake(alice: &mut Peer, bob: &mut Peer) {
    alice
        .registry
        .enable_otr(alice.id(), bob.uri())
        .await
        .unwrap();
    otr_state(alice, OtrState::Encrypted).await;
    otr_state(bob, OtrState::Encrypted).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s1_cleartext_exchange() {
    let transport = LoopbackTransport::new();
    let mut alice = start_peer(&transport, "sip:a@example.com", "Alice", |s| s.use_cpim = false, None);
    let mut bob = start_peer(&transport, "sip:b@example.com", "Bob", |s| s.use_cpim = false, None);

    let id = alice
        .registry
        .send_message(OutgoingRequest::text(alice.id(), bob.uri(), "hello"))
        .await
        .unwrap();

    let message = received(&mut bob).await;
    assert_eq!(message.text(), Some("hello"));
    assert!(!message.is_secure);
    assert_eq!(
        message.sender.map(|s| s.uri.address()).as_deref(),
        Some("a@example.com")
    );

    let succeeded = wait_for_event(&mut alice.events, WAIT, |e| {
        matches!(e, MessagingEvent::MessageDidSucceed { id: got, .. } if *got == id)
    })
    .await;
    assert!(succeeded.is_some());

    let wire = sent_between(&transport, &alice, &bob);
    assert_eq!(wire.len(), 1);
    assert_eq!(wire[0].content_type, "text/plain");
    assert_eq!(wire[0].body, b"hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_cpim_with_delivery_notification() {
    let transport = LoopbackTransport::new();
    let mut alice = start_peer(&transport, "sip:a@example.com", "Alice", |_| {}, None);
    let mut bob = start_peer(&transport, "sip:b@example.com", "Bob", |_| {}, None);

    let id = alice
        .registry
        .send_message(OutgoingRequest::text(alice.id(), bob.uri(), "hi").with_id("abc"))
        .await
        .unwrap();
    assert_eq!(id.as_str(), "abc");

    let message = received(&mut bob).await;
    assert_eq!(message.id.as_str(), "abc");
    assert_eq!(message.text(), Some("hi"));

    let mut succeeded = false;
    let mut notified = false;
    while !(succeeded && notified) {
        let event = wait_for_event(&mut alice.events, WAIT, |e| match e {
            MessagingEvent::MessageDidSucceed { id, .. }
            | MessagingEvent::GotDispositionNotification { id, .. } => id.as_str() == "abc",
            _ => false,
        })
        .await
        .expect("alice saw no outcome for abc");
        match event {
            MessagingEvent::MessageDidSucceed { .. } => succeeded = true,
            MessagingEvent::GotDispositionNotification { status, .. } => {
                assert_eq!(status, NotificationStatus::Delivered);
                notified = true;
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    let notification = sent_between(&transport, &bob, &alice)
        .into_iter()
        .filter_map(|r| CpimCodec::decode(&r.body).ok())
        .find(|p| p.content_type == content_types::IMDN)
        .expect("bob sent no notification");
    assert!(contains(&notification.content, b"<message-id>abc</message-id>"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s3_pgp_encrypt_and_decrypt() {
    let transport = LoopbackTransport::new();
    let mut alice = start_peer(&transport, "sip:a@example.com", "Alice", |_| {}, None);
    let mut bob = start_peer(&transport, "sip:b@example.com", "Bob", |_| {}, None);
    let mut eve = start_peer(&transport, "sip:e@example.com", "Eve", |_| {}, None);

    alice.registry.generate_keys(alice.id()).await.unwrap();
    bob.registry.generate_keys(bob.id()).await.unwrap();
    let bob_public = bob
        .registry
        .key_store()
        .load_own_public(bob.id())
        .unwrap()
        .export_public_key()
        .unwrap();
    alice
        .registry
        .key_store()
        .save_public("b@example.com", bob_public.as_bytes())
        .unwrap();

    // Eve holds only a private key Alice has since replaced.
    let retired = KeyStore::create_keypair(None, "a@example.com", KeyAlgorithm::Cv25519).unwrap();
    eve.registry.key_store().store_keypair(eve.id(), &retired).unwrap();

    let id = alice
        .registry
        .send_message(OutgoingRequest::text(alice.id(), bob.uri(), "secret"))
        .await
        .unwrap();

    let decrypted = wait_for_event(&mut bob.events, WAIT, |e| {
        matches!(e, MessagingEvent::PgpMessageDidDecrypt { .. })
    })
    .await;
    let Some(MessagingEvent::PgpMessageDidDecrypt { message, account, .. }) = decrypted else {
        panic!("bob did not decrypt");
    };
    assert_eq!(account, "b@example.com");
    assert_eq!(message.id, id);
    assert_eq!(message.text(), Some("secret"));
    assert!(message.is_secure);

    let delivered = received(&mut bob).await;
    assert_eq!(delivered.text(), Some("secret"));

    let request = sent_between(&transport, &alice, &bob)
        .into_iter()
        .find(|r| {
            CpimCodec::decode(&r.body)
                .map(|p| p.content_type == content_types::TEXT_PLAIN)
                .unwrap_or(false)
        })
        .expect("alice sent no text message");
    let payload = CpimCodec::decode(&request.body).unwrap();
    assert!(payload.content.starts_with(b"-----BEGIN PGP MESSAGE-----"));
    assert!(!contains(&payload.content, b"secret"));

    eve.registry.inbound_sink().deliver(IncomingSipMessage {
        request_uri: eve.uri().clone(),
        from: request.from.clone(),
        to: eve.account.identity(),
        content_type: request.content_type.clone(),
        headers: Vec::new(),
        body: request.body.clone(),
    });
    let refused = wait_for_event(&mut eve.events, WAIT, |e| {
        matches!(e, MessagingEvent::PgpMessageDidNotDecrypt { .. })
    })
    .await;
    assert!(matches!(
        refused,
        Some(MessagingEvent::PgpMessageDidNotDecrypt { ref session, .. }) if session.account == "e@example.com"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s4_otr_handshake_then_encrypted_message() {
    let transport = LoopbackTransport::new();
    let mut alice = start_peer(&transport, "sip:a@example.com", "Alice", |s| s.use_cpim = false, None);
    let mut bob = start_peer(&transport, "sip:b@example.com", "Bob", |s| s.use_cpim = false, None);

    otr_handshake(&mut alice, &mut bob).await;
    let handshake = sent_between(&transport, &alice, &bob);
    assert!(handshake[0].body.starts_with(b"?OTR"));

    let alice_info = alice.registry.session_info(alice.id(), bob.uri()).await.unwrap();
    let bob_info = bob.registry.session_info(bob.id(), alice.uri()).await.unwrap();
    assert_eq!(alice_info.otr_state, OtrState::Encrypted);
    assert_eq!(alice_info.peer_fingerprint, bob_info.local_fingerprint);

    let id = alice
        .registry
        .send_message(OutgoingRequest::text(alice.id(), bob.uri(), "ping"))
        .await
        .unwrap();
    let message = received(&mut bob).await;
    assert_eq!(message.text(), Some("ping"));
    assert!(message.is_secure);

    let encrypted = wait_for_event(&mut alice.events, WAIT, |e| {
        matches!(e, MessagingEvent::MessageDidEncrypt { id: got, .. } if *got == id)
    })
    .await;
    assert!(encrypted.is_some());
    let wire = sent_between(&transport, &alice, &bob);
    assert!(wire.iter().any(|r| r.body.starts_with(b"?OTR:")));
    assert!(wire.iter().all(|r| !contains(&r.body, b"ping")));

    bob.registry.disable_otr(bob.id(), alice.uri()).await.unwrap();
    otr_state(&mut alice, OtrState::Plaintext).await;

    alice
        .registry
        .send_message(OutgoingRequest::text(alice.id(), bob.uri(), "after"))
        .await
        .unwrap();
    let message = received(&mut bob).await;
    assert_eq!(message.text(), Some("after"));
    assert!(!message.is_secure);
    let last = sent_between(&transport, &alice, &bob).pop().unwrap();
    assert_eq!(last.body, b"after");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_downgrade_is_refused() {
    let transport = LoopbackTransport::new();
    let switch = DowngradeSwitch::new();
    let mut alice = start_peer(
        &transport,
        "sip:a@example.com",
        "Alice",
        |s| s.use_cpim = false,
        Some(Arc::new(switch.clone())),
    );
    let mut bob = start_peer(&transport, "sip:b@example.com", "Bob", |s| s.use_cpim = false, None);

    otr_handshake(&mut alice, &mut bob).await;
    switch.trip();

    let result = alice
        .registry
        .send_message(OutgoingRequest::text(alice.id(), bob.uri(), "boom"))
        .await;
    assert!(matches!(result, Err(MessengerError::SecurityDowngrade)));

    // Alice stopped OTR and told Bob.
    otr_state(&mut bob, OtrState::Plaintext).await;
    let info = alice.registry.session_info(alice.id(), bob.uri()).await.unwrap();
    assert_eq!(info.otr_state, OtrState::Plaintext);
    assert!(transport.sent().iter().all(|r| !contains(&r.body, b"boom")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s6_composing_indication_suppressed() {
    let transport = LoopbackTransport::new();
    let mut alice = start_peer(
        &transport,
        "sip:a@example.com",
        "Alice",
        |s| {
            s.use_cpim = false;
            s.enable_iscomposing = false;
        },
        None,
    );
    let mut bob = start_peer(&transport, "sip:b@example.com", "Bob", |s| s.use_cpim = false, None);

    alice
        .registry
        .send_composing_indication(alice.id(), bob.uri(), ComposingState::Active, None, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transport.sent().is_empty());
    assert!(matches!(
        alice.registry.session_info(alice.id(), bob.uri()).await,
        Err(MessengerError::UnknownSession { .. })
    ));

    // Bob's indications still reach Alice once they talk.
    alice
        .registry
        .send_message(OutgoingRequest::text(alice.id(), bob.uri(), "hi"))
        .await
        .unwrap();
    received(&mut bob).await;
    bob.registry
        .send_composing_indication(bob.id(), alice.uri(), ComposingState::Active, Some(60), None)
        .await
        .unwrap();
    let indication = wait_for_event(&mut alice.events, WAIT, |e| {
        matches!(e, MessagingEvent::GotComposingIndication { .. })
    })
    .await;
    assert!(matches!(
        indication,
        Some(MessagingEvent::GotComposingIndication {
            state: ComposingState::Active,
            refresh: 60,
            ..
        })
    ));
    assert!(alice.registry.peer_is_composing(alice.id(), bob.uri()).await.unwrap());

    alice
        .registry
        .send_composing_indication(alice.id(), bob.uri(), ComposingState::Idle, None, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(transport
        .sent()
        .iter()
        .all(|r| r.content_type != content_types::IS_COMPOSING || r.from.uri.address() != "a@example.com"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn ephemeral_bodies_are_never_pending() {
    let transport = LoopbackTransport::new();
    let mut alice = start_peer(&transport, "sip:a@example.com", "Alice", |s| s.use_cpim = false, None);
    let bob = start_peer(&transport, "sip:b@example.com", "Bob", |s| s.use_cpim = false, None);

    let composing = IsComposingDocument::new(ComposingState::Active).to_xml();
    let composing_id = alice
        .registry
        .send_message(OutgoingRequest::new(
            alice.id(),
            bob.uri(),
            composing,
            content_types::IS_COMPOSING,
        ))
        .await
        .unwrap();
    let text_id = alice
        .registry
        .send_message(OutgoingRequest::text(alice.id(), bob.uri(), "after"))
        .await
        .unwrap();

    // Events leave the runtime in order, so everything about the composing body
    // precedes the text's success.
    let mut seen = Vec::new();
    let succeeded = wait_for_event(&mut alice.events, WAIT, |e| {
        seen.push(e.clone());
        matches!(e, MessagingEvent::MessageDidSucceed { id, .. } if *id == text_id)
    })
    .await;
    assert!(succeeded.is_some());

    assert!(!seen.iter().any(|e| matches!(
        e,
        MessagingEvent::MessageIsPending { id, .. }
            | MessagingEvent::MessageDidSucceed { id, .. }
            | MessagingEvent::MessageDidFail { id, .. } if *id == composing_id
    )));
    assert!(seen
        .iter()
        .any(|e| matches!(e, MessagingEvent::MessageIsPending { id, .. } if *id == text_id)));
    assert!(sent_between(&transport, &alice, &bob)
        .iter()
        .any(|r| r.content_type == content_types::IS_COMPOSING));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn added_accounts_have_their_otr_identity_ready() {
    let transport = LoopbackTransport::new();
    let alice = start_peer(&transport, "sip:a@example.com", "Alice", |s| s.use_cpim = false, None);
    let mut bob = start_peer(&transport, "sip:b@example.com", "Bob", |s| s.use_cpim = false, None);

    let carol = AccountIdentity::new(SipUri::parse("sip:c@example.com").unwrap(), Some("Carol"));
    alice.registry.add_account(carol.clone()).await.unwrap();
    transport.register(&carol.id, alice.registry.inbound_sink());
    let keys = alice.registry.key_store();
    assert!(keys.otr_identity_path(&carol.id).exists());
    let stored = keys.load_or_create_otr_identity(&carol.id).unwrap();

    alice.registry.enable_otr(&carol.id, bob.uri()).await.unwrap();
    otr_state(&mut bob, OtrState::Encrypted).await;
    let info = alice.registry.session_info(&carol.id, bob.uri()).await.unwrap();
    assert_eq!(info.otr_state, OtrState::Encrypted);
    assert_eq!(info.local_fingerprint, Some(stored.fingerprint()));
}
