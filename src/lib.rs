#![doc(html_root_url = "https://docs.rs/netframing/latest")]
//! Public API for the `netframing` library.
//!
//! This crate implements the receiving side of a message-framing transport:
//! it classifies each accepted byte stream by framing mode, negotiates the
//! duplex or singleton preamble (including in-band stream upgrades), and
//! hands the connection to the endpoint listener its via resolves to.
//! Finished connections may be offered back to a bounded reuse pool.

pub mod buffer_pool;
pub mod chunked;
pub mod connection;
pub mod demux;
pub mod endpoint;
pub mod error;
pub mod fault;
pub mod metrics;
pub mod mode;
pub mod panic;
pub mod pool;
pub mod preamble;
pub mod record;
pub mod rewind_stream;
pub mod server;
pub mod settings;
pub mod upgrade;
pub mod varint;

pub use demux::{ConnectionDemuxer, ConnectionOutcome, ReuseHandle};
pub use endpoint::{EndpointListener, SessionConnection, SingletonConnection, SingletonMessage};
pub use error::{DispatchError, FramingError};
pub use fault::FaultCode;
pub use metrics::{CONNECTIONS_ACCEPTED, CONNECTIONS_PENDING, ERRORS_TOTAL, FAULTS_SENT};
pub use mode::FramingMode;
pub use server::{DemuxServer, ServerError};
pub use settings::{DemuxConfig, TransferMode, TransportSettings, ViaRegistry, ViaResolver};
pub use upgrade::{SecurityContext, StreamUpgradeAcceptor};
