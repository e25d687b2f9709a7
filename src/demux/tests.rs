use std::sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use rstest::{fixture, rstest};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex},
    sync::mpsc,
};
use tracing_test::traced_test;

use super::*;
use crate::{
    chunked::encode_body,
    endpoint::{EndpointListener, SingletonMessage},
    error::DispatchError,
    record,
    settings::{TransferMode, ViaRegistry},
};

const VIA: &str = "net.tcp://host/svc";
const MSBIN: u8 = 0x07;

enum Accepted {
    Session(SessionConnection),
    Singleton(SingletonConnection),
}

struct Recorder {
    tx: mpsc::UnboundedSender<Accepted>,
    refuse: Mutex<Option<DispatchError>>,
}

#[async_trait]
impl EndpointListener for Recorder {
    async fn activate(&self, _via: &str) -> Result<(), DispatchError> {
        self.refuse
            .lock()
            .expect("lock")
            .take()
            .map_or(Ok(()), Err)
    }

    async fn accept_session(&self, session: SessionConnection) -> Result<(), DispatchError> {
        let _ = self.tx.send(Accepted::Session(session));
        Ok(())
    }

    async fn accept_singleton(&self, singleton: SingletonConnection) -> Result<(), DispatchError> {
        let _ = self.tx.send(Accepted::Singleton(singleton));
        Ok(())
    }
}

struct Harness {
    registry: Arc<ViaRegistry>,
    listener: Arc<Recorder>,
    accepted: mpsc::UnboundedReceiver<Accepted>,
}

impl Harness {
    fn register(&self, configure: impl FnOnce(TransportSettings) -> TransportSettings) {
        let listener: Arc<dyn EndpointListener> = self.listener.clone();
        self.registry
            .register(VIA, configure(TransportSettings::new(listener)));
    }

    fn demuxer(&self) -> ConnectionDemuxer {
        ConnectionDemuxer::builder(self.registry.clone()).build()
    }

    async fn session(&mut self) -> SessionConnection {
        match self.accepted.recv().await {
            Some(Accepted::Session(session)) => session,
            _ => panic!("expected a dispatched session"),
        }
    }

    async fn singleton(&mut self) -> SingletonConnection {
        match self.accepted.recv().await {
            Some(Accepted::Singleton(singleton)) => singleton,
            _ => panic!("expected a dispatched singleton"),
        }
    }
}

#[fixture]
fn harness() -> Harness {
    let (tx, accepted) = mpsc::unbounded_channel();
    let harness = Harness {
        registry: Arc::new(ViaRegistry::new()),
        listener: Arc::new(Recorder {
            tx,
            refuse: Mutex::new(None),
        }),
        accepted,
    };
    harness.register(|settings| settings);
    harness
}

fn preamble(mode: u8, via: &str) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(&[
        record::VERSION,
        record::MAJOR_VERSION,
        record::MINOR_VERSION,
        record::MODE,
        mode,
    ]);
    record::put_string_record(&mut buf, record::VIA, via);
    buf.put_slice(&[record::KNOWN_ENCODING, MSBIN]);
    buf
}

async fn client_with(bytes: &[u8]) -> (DuplexStream, DuplexStream) {
    let (mut client, server) = duplex(4096);
    client.write_all(bytes).await.expect("write preamble");
    (client, server)
}

async fn read_fault(client: &mut DuplexStream) -> FaultCode {
    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.expect("read fault");
    assert_eq!(reply.first(), Some(&record::FAULT), "reply {reply:?}");
    let text = std::str::from_utf8(&reply[2..]).expect("utf8 fault");
    FaultCode::from_wire(text).expect("known fault")
}

#[rstest]
#[tokio::test]
async fn duplex_session_is_dispatched_with_leftover_bytes(mut harness: Harness) {
    let mut bytes = preamble(record::MODE_DUPLEX, "net.tcp://host/svc/instance");
    bytes.put_slice(b"session traffic");
    let (_client, server) = client_with(&bytes).await;

    let outcome = harness.demuxer().serve(server).await;
    assert!(matches!(
        outcome,
        ConnectionOutcome::Dispatched { mode: FramingMode::Duplex, ref via }
            if via == "net.tcp://host/svc/instance"
    ));

    let mut session = harness.session().await;
    assert_eq!(session.content_type, "application/soap+msbin1");
    let mut traffic = [0_u8; 15];
    session
        .connection
        .read_exact(&mut traffic)
        .await
        .expect("replayed bytes");
    assert_eq!(&traffic, b"session traffic");
}

#[rstest]
#[tokio::test]
async fn unknown_via_is_faulted(mut harness: Harness) {
    let (mut client, server) = client_with(&preamble(record::MODE_DUPLEX, "net.tcp://host/nope")).await;
    client.shutdown().await.expect("half close");

    let outcome = harness.demuxer().serve(server).await;
    let ConnectionOutcome::Failed(err) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(err.fault_code(), Some(FaultCode::EndpointNotFound));
    assert_eq!(read_fault(&mut client).await, FaultCode::EndpointNotFound);
    assert!(harness.accepted.try_recv().is_err());
}

#[rstest]
#[case(record::MODE_SIMPLEX, FaultCode::UnsupportedMode)]
#[case(record::MODE_SINGLETON_SIZED, FaultCode::UnsupportedMode)]
#[case(0x2a, FaultCode::UnsupportedMode)]
#[tokio::test]
async fn unsupported_modes_are_faulted(
    harness: Harness,
    #[case] mode: u8,
    #[case] expected: FaultCode,
) {
    let (mut client, server) = client_with(&preamble(mode, VIA)).await;
    client.shutdown().await.expect("half close");

    assert!(matches!(
        harness.demuxer().serve(server).await,
        ConnectionOutcome::Failed(_)
    ));
    assert_eq!(read_fault(&mut client).await, expected);
}

#[rstest]
#[tokio::test]
async fn refused_activation_reports_the_listener_fault(harness: Harness) {
    *harness.listener.refuse.lock().expect("lock") = Some(DispatchError::TooBusy);
    let (mut client, server) = client_with(&preamble(record::MODE_DUPLEX, VIA)).await;
    client.shutdown().await.expect("half close");

    let outcome = harness.demuxer().serve(server).await;
    assert!(matches!(
        outcome,
        ConnectionOutcome::Failed(FramingError::Fault {
            phase: Phase::Dispatch,
            code: FaultCode::ServerTooBusy,
            ..
        })
    ));
    assert_eq!(read_fault(&mut client).await, FaultCode::ServerTooBusy);
}

#[rstest]
#[tokio::test]
async fn rejected_content_type_is_faulted(harness: Harness) {
    harness.register(|settings| settings.with_validator(|ct: &str| ct.starts_with("text/")));
    let (mut client, server) = client_with(&preamble(record::MODE_DUPLEX, VIA)).await;
    client.shutdown().await.expect("half close");

    harness.demuxer().serve(server).await;
    assert_eq!(read_fault(&mut client).await, FaultCode::ContentTypeInvalid);
}

#[rstest]
#[tokio::test]
async fn close_before_any_byte_is_graceful(harness: Harness) {
    let (client, server) = duplex(64);
    drop(client);
    assert!(matches!(
        harness.demuxer().serve(server).await,
        ConnectionOutcome::Closed
    ));
}

#[rstest]
#[tokio::test]
async fn close_mid_preamble_is_premature(harness: Harness) {
    let bytes = preamble(record::MODE_DUPLEX, VIA);
    let (client, server) = client_with(&bytes[..8]).await;
    drop(client);

    let outcome = harness.demuxer().serve(server).await;
    assert!(matches!(
        outcome,
        ConnectionOutcome::Failed(FramingError::PrematureEof {
            phase: Phase::SessionPreamble,
            ..
        })
    ));
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn stalled_preamble_times_out_without_fault(harness: Harness) {
    let bytes = preamble(record::MODE_DUPLEX, VIA);
    let (mut client, server) = client_with(&bytes[..3]).await;
    let demuxer = ConnectionDemuxer::builder(harness.registry.clone())
        .channel_initialization_timeout(Duration::from_secs(2))
        .build();

    let outcome = demuxer.serve(server).await;
    assert!(matches!(
        outcome,
        ConnectionOutcome::Failed(FramingError::Timeout {
            phase: Phase::Mode,
            ..
        })
    ));
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.expect("closed");
    assert!(rest.is_empty());
}

fn singleton_request(body: &[u8], chunks: &[usize]) -> BytesMut {
    let mut bytes = preamble(record::MODE_SINGLETON_UNSIZED, VIA);
    bytes.put_u8(record::PREAMBLE_END);
    bytes.put_slice(&encode_body(body, chunks));
    bytes
}

#[rstest]
#[tokio::test]
async fn buffered_singleton_reassembles_chunks(mut harness: Harness) {
    let (mut client, server) = client_with(&singleton_request(b"0123456789", &[6, 4])).await;

    let outcome = harness.demuxer().serve(server).await;
    assert!(matches!(
        outcome,
        ConnectionOutcome::Dispatched {
            mode: FramingMode::Singleton,
            ..
        }
    ));
    let mut ack = [0_u8; 1];
    client.read_exact(&mut ack).await.expect("ack");
    assert_eq!(ack, [record::PREAMBLE_ACK]);

    let singleton = harness.singleton().await;
    assert!(singleton.security.is_none());
    let SingletonMessage::Buffered { body, .. } = singleton.message else {
        panic!("expected a buffered body");
    };
    assert_eq!(&body[..], b"0123456789");
}

#[rstest]
#[tokio::test]
async fn streamed_singleton_hands_over_a_reader(mut harness: Harness) {
    harness.register(|settings| settings.transfer_mode(TransferMode::Streamed));
    let (_client, server) = client_with(&singleton_request(b"streamed body", &[3, 10])).await;

    harness.demuxer().serve(server).await;
    let SingletonMessage::Streamed(mut reader) = harness.singleton().await.message else {
        panic!("expected a streamed body");
    };
    let mut body = String::new();
    reader.read_to_string(&mut body).await.expect("body");
    assert_eq!(body, "streamed body");
    assert!(reader.is_done());
}

#[rstest]
#[tokio::test]
async fn oversized_buffered_body_is_faulted(harness: Harness) {
    harness.register(|settings| settings.max_buffered_message_size(4));
    let (mut client, server) = client_with(&singleton_request(b"too large", &[9])).await;
    client.shutdown().await.expect("half close");

    let outcome = harness.demuxer().serve(server).await;
    assert!(matches!(
        outcome,
        ConnectionOutcome::Failed(FramingError::Fault {
            code: FaultCode::MaxMessageSizeExceeded,
            ..
        })
    ));
    let mut ack = [0_u8; 1];
    client.read_exact(&mut ack).await.expect("ack");
    assert_eq!(read_fault(&mut client).await, FaultCode::MaxMessageSizeExceeded);
}

#[rstest]
#[tokio::test]
async fn required_upgrade_without_acceptor_is_rejected(harness: Harness) {
    harness.register(|settings| settings.require_upgrade(true));
    let (mut client, server) = client_with(&singleton_request(b"x", &[1])).await;
    client.shutdown().await.expect("half close");

    harness.demuxer().serve(server).await;
    assert_eq!(read_fault(&mut client).await, FaultCode::UpgradeInvalid);
}

#[rstest]
#[tokio::test]
async fn unknown_upgrade_is_rejected(harness: Harness) {
    let mut bytes = preamble(record::MODE_SINGLETON_UNSIZED, VIA);
    record::put_string_record(&mut bytes, record::UPGRADE_REQUEST, "application/ssl-tls");
    let (mut client, server) = client_with(&bytes).await;
    client.shutdown().await.expect("half close");

    let outcome = harness.demuxer().serve(server).await;
    assert!(matches!(
        outcome,
        ConnectionOutcome::Failed(FramingError::Fault {
            phase: Phase::Upgrade,
            ..
        })
    ));
    assert_eq!(read_fault(&mut client).await, FaultCode::UpgradeInvalid);
}

#[rstest]
#[traced_test]
#[tokio::test]
async fn contained_errors_reach_callback_and_log(harness: Harness) {
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let demuxer = ConnectionDemuxer::builder(harness.registry.clone())
        .on_error(move |err| {
            assert_eq!(err.kind(), "fault");
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let (mut client, server) = client_with(&preamble(record::MODE_DUPLEX, "net.tcp://elsewhere/")).await;
    client.shutdown().await.expect("half close");

    demuxer.serve(server).await;
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(logs_contain("connection failed"));
}

#[rstest]
#[tokio::test]
async fn reused_connection_is_dispatched_again(mut harness: Harness) {
    let (mut client, server) = client_with(&preamble(record::MODE_DUPLEX, VIA)).await;
    let demuxer = harness.demuxer();
    demuxer.serve(server).await;

    let session = harness.session().await;
    assert!(
        session
            .reuse
            .reuse(session.connection, Duration::from_secs(1))
    );
    assert_eq!(demuxer.reuse_pool().in_use(), 1);

    client
        .write_all(&preamble(record::MODE_DUPLEX, VIA))
        .await
        .expect("second preamble");
    let second = harness.accepted.recv().await.expect("redispatched");
    assert!(matches!(second, Accepted::Session(_)));
    demuxer.shutdown().await;
    assert_eq!(demuxer.reuse_pool().in_use(), 0);
}

#[rstest]
#[tokio::test]
async fn full_pool_closes_offered_connection(mut harness: Harness) {
    let demuxer = ConnectionDemuxer::builder(harness.registry.clone())
        .max_pooled_connections(0)
        .build();
    let (mut client, server) = client_with(&preamble(record::MODE_DUPLEX, VIA)).await;
    demuxer.serve(server).await;

    let session = harness.session().await;
    assert!(
        !session
            .reuse
            .reuse(session.connection, Duration::from_secs(1))
    );
    demuxer.shutdown().await;
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.expect("closed");
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn idle_pooled_connection_expires(mut harness: Harness) {
    let demuxer = ConnectionDemuxer::builder(harness.registry.clone())
        .idle_timeout(Duration::from_secs(5))
        .build();
    let (_client, server) = client_with(&preamble(record::MODE_DUPLEX, VIA)).await;
    demuxer.serve(server).await;

    let session = harness.session().await;
    assert!(
        session
            .reuse
            .reuse(session.connection, Duration::from_secs(1))
    );
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(demuxer.reuse_pool().in_use(), 0);
    assert!(harness.accepted.try_recv().is_err());
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn partial_preamble_on_pooled_connection_times_out(mut harness: Harness) {
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    let demuxer = ConnectionDemuxer::builder(harness.registry.clone())
        .idle_timeout(Duration::from_secs(5))
        .on_error(move |err| sink.lock().expect("lock").push(err.kind()))
        .build();
    let (mut client, server) = client_with(&preamble(record::MODE_DUPLEX, VIA)).await;
    demuxer.serve(server).await;

    let session = harness.session().await;
    assert!(
        session
            .reuse
            .reuse(session.connection, Duration::from_secs(1))
    );
    client
        .write_all(&[record::VERSION, record::MAJOR_VERSION])
        .await
        .expect("partial preamble");
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(*kinds.lock().expect("lock"), ["timeout"]);
    assert_eq!(demuxer.reuse_pool().in_use(), 0);
    assert!(harness.accepted.try_recv().is_err());
}

#[rstest]
#[tokio::test]
async fn shutdown_cancels_pending_preambles(harness: Harness) {
    let demuxer = harness.demuxer();
    let (_client, server) = duplex(64);
    demuxer.spawn(server);
    assert_eq!(demuxer.task_count(), 1);
    demuxer.shutdown().await;
    assert_eq!(demuxer.task_count(), 0);
    assert!(demuxer.reserve().await.is_none());
}

struct Panicking;

#[async_trait]
impl EndpointListener for Panicking {
    async fn accept_session(&self, _session: SessionConnection) -> Result<(), DispatchError> {
        panic!("listener exploded")
    }

    async fn accept_singleton(&self, _singleton: SingletonConnection) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[traced_test]
#[tokio::test]
async fn listener_panics_are_contained() {
    let registry = ViaRegistry::new();
    registry.register(VIA, TransportSettings::new(Arc::new(Panicking)));
    let demuxer = ConnectionDemuxer::new(registry);
    let (_client, server) = client_with(&preamble(record::MODE_DUPLEX, VIA)).await;

    demuxer.spawn(server);
    tokio::time::timeout(Duration::from_secs(5), async {
        while !logs_contain("connection task panicked") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("panic logged");
    demuxer.shutdown().await;
}

/// Serves every session inline and never returns.
struct Inline {
    started: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl EndpointListener for Inline {
    async fn accept_session(&self, _session: SessionConnection) -> Result<(), DispatchError> {
        let _ = self.started.send(());
        std::future::pending().await
    }

    async fn accept_singleton(&self, _singleton: SingletonConnection) -> Result<(), DispatchError> {
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_does_not_wait_for_listeners() {
    let (started, mut started_rx) = mpsc::unbounded_channel();
    let registry = ViaRegistry::new();
    registry.register(VIA, TransportSettings::new(Arc::new(Inline { started })));
    let demuxer = ConnectionDemuxer::new(registry);
    let (_client, server) = client_with(&preamble(record::MODE_DUPLEX, VIA)).await;

    demuxer.spawn(server);
    started_rx.recv().await.expect("listener entered");
    tokio::time::timeout(Duration::from_secs(2), demuxer.shutdown())
        .await
        .expect("shutdown completes while the listener is still serving");
    assert_eq!(demuxer.task_count(), 0);
}

fn assert_send<T: Send>(_: &T) {}

#[rstest]
#[tokio::test]
async fn connection_futures_can_be_spawned(harness: Harness) {
    harness.register(|settings| settings);
    let demuxer = harness.demuxer();
    let (_fresh_client, fresh) = duplex(64);
    let (_cached_client, cached) = duplex(64);

    assert_send(&Arc::clone(&demuxer.inner).serve(Box::new(fresh), Origin::Fresh, None));
    let slot = demuxer.inner.pool.try_acquire().expect("slot");
    assert_send(&Arc::clone(&demuxer.inner).serve_cached(Box::new(cached), slot));
}
