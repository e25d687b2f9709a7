//! Test helpers shared across server modules.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

use rstest::fixture;

use super::{Bound, DemuxServer};
use crate::{demux::ConnectionDemuxer, settings::ViaRegistry};

#[fixture]
pub fn demuxer() -> ConnectionDemuxer { ConnectionDemuxer::new(ViaRegistry::new()) }

/// Returns a bound [`StdTcpListener`] on a free port for use in tests.
///
/// Keeping the listener bound prevents another process from claiming the
/// port between discovery and use.
#[fixture]
pub fn free_listener() -> StdTcpListener {
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0);
    StdTcpListener::bind(addr).expect("Failed to bind free port listener")
}

/// Extract the bound address from a listener.
#[must_use]
pub fn listener_addr(listener: &StdTcpListener) -> SocketAddr {
    listener
        .local_addr()
        .expect("failed to get listener address")
}

pub fn bind_server(demuxer: ConnectionDemuxer, listener: StdTcpListener) -> DemuxServer<Bound> {
    DemuxServer::new(demuxer)
        .bind_existing_listener(listener)
        .expect("Failed to bind")
}
