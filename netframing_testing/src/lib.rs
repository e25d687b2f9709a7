//! Utilities for exercising a
//! [`ConnectionDemuxer`](netframing::demux::ConnectionDemuxer) with
//! in-memory streams during tests.
//!
//! [`ClientPreamble`] writes the client side of the framing protocol,
//! [`RecordingListener`] captures dispatched connections, [`XorUpgrade`]
//! is a toy stream upgrade that visibly transforms the bytes after it, and
//! [`drive_demuxer`] runs one connection to completion and returns what the
//! peer saw.
//!
//! ```rust
//! use netframing::{ConnectionDemuxer, ConnectionOutcome, FaultCode, ViaRegistry};
//! use netframing_testing::{ClientPreamble, drive_demuxer, parse_fault};
//!
//! # async fn demo() -> std::io::Result<()> {
//! let demuxer = ConnectionDemuxer::new(ViaRegistry::new());
//! let hello = ClientPreamble::duplex("net.tcp://host/missing").encode();
//! let (outcome, reply) = drive_demuxer(&demuxer, vec![hello.to_vec()]).await?;
//! assert!(matches!(outcome, ConnectionOutcome::Failed(_)));
//! assert_eq!(parse_fault(&reply), Some(FaultCode::EndpointNotFound));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod drive;
pub mod listener;
pub mod upgrade;

pub use client::{ClientPreamble, parse_fault, upgrade_request};
pub use drive::drive_demuxer;
pub use listener::{Accepted, RecordingListener, recording_listener};
pub use upgrade::{XOR_UPGRADE, XorStream, XorUpgrade, client_xor_upgrade};
