//! An endpoint listener that records what it is handed.

use std::sync::{
    Arc,
    Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use netframing::{
    DispatchError,
    EndpointListener,
    SessionConnection,
    SingletonConnection,
};
use rstest::fixture;
use tokio::sync::mpsc;

/// A connection delivered to a [`RecordingListener`].
#[derive(Debug)]
pub enum Accepted {
    /// A duplex session.
    Session(SessionConnection),
    /// A singleton request.
    Singleton(SingletonConnection),
}

impl Accepted {
    /// Unwrap a session, panicking otherwise.
    pub fn into_session(self) -> SessionConnection {
        match self {
            Self::Session(session) => session,
            Self::Singleton(singleton) => panic!("expected a session, got {singleton:?}"),
        }
    }

    /// Unwrap a singleton, panicking otherwise.
    pub fn into_singleton(self) -> SingletonConnection {
        match self {
            Self::Singleton(singleton) => singleton,
            Self::Session(session) => panic!("expected a singleton, got {session:?}"),
        }
    }
}

/// Listener that forwards every dispatched connection to a channel.
#[derive(Debug)]
pub struct RecordingListener {
    tx: mpsc::UnboundedSender<Accepted>,
    activations: AtomicUsize,
    refuse: Mutex<Option<DispatchError>>,
}

impl RecordingListener {
    /// Create a listener and the receiver its connections arrive on.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Accepted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Arc::new(Self {
            tx,
            activations: AtomicUsize::new(0),
            refuse: Mutex::new(None),
        });
        (listener, rx)
    }

    /// Fail the next activation with `err`.
    pub fn refuse_next(&self, err: DispatchError) {
        *self.refuse.lock().expect("refusal lock poisoned") = Some(err);
    }

    /// Number of activation requests seen.
    pub fn activations(&self) -> usize { self.activations.load(Ordering::SeqCst) }
}

#[async_trait]
impl EndpointListener for RecordingListener {
    async fn activate(&self, _via: &str) -> Result<(), DispatchError> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        match self.refuse.lock().expect("refusal lock poisoned").take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn accept_session(&self, session: SessionConnection) -> Result<(), DispatchError> {
        self.tx
            .send(Accepted::Session(session))
            .map_err(|_| DispatchError::Unavailable)
    }

    async fn accept_singleton(&self, singleton: SingletonConnection) -> Result<(), DispatchError> {
        self.tx
            .send(Accepted::Singleton(singleton))
            .map_err(|_| DispatchError::Unavailable)
    }
}

/// Fixture pairing a [`RecordingListener`] with its receiver.
#[allow(
    unused_braces,
    reason = "rustc false positive for single line rstest fixtures"
)]
#[fixture]
pub fn recording_listener() -> (Arc<RecordingListener>, mpsc::UnboundedReceiver<Accepted>) {
    RecordingListener::new()
}
