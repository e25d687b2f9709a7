//! In-memory driving of a single demultiplexed connection.

use std::io;

use futures::FutureExt as _;
use netframing::{ConnectionDemuxer, ConnectionOutcome};
use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

const DEFAULT_CAPACITY: usize = 4096;

/// Serve one duplex-stream connection on `demuxer`, writing each frame from
/// the client half, and return the outcome with every byte the server
/// wrote back.
///
/// The client half-closes after the last frame and reads until the server
/// closes, so this suits connections the demultiplexer ends itself: faults,
/// timeouts and early closes. A dispatched connection stays open for as long
/// as its listener holds it. If the demultiplexer panics, the panic message
/// is surfaced as an `io::Error` beginning with `"server task failed"`.
///
/// # Errors
///
/// Returns client-side I/O errors and server panics.
pub async fn drive_demuxer(
    demuxer: &ConnectionDemuxer,
    frames: Vec<Vec<u8>>,
) -> io::Result<(ConnectionOutcome, Vec<u8>)> {
    let (mut client, server) = duplex(DEFAULT_CAPACITY);

    let server_fut = async {
        std::panic::AssertUnwindSafe(demuxer.serve(server))
            .catch_unwind()
            .await
            .map_err(|panic| {
                let panic_msg = netframing::panic::format_panic(panic);
                io::Error::other(format!("server task failed: {panic_msg}"))
            })
    };

    let client_fut = async {
        for frame in &frames {
            client.write_all(frame).await?;
        }
        client.shutdown().await?;

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await?;
        io::Result::Ok(buf)
    };

    tokio::try_join!(server_fut, client_fut)
}
