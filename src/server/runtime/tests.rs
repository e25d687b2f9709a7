//! Tests for server runtime behaviour.

use std::{
    io,
    sync::{Arc, Mutex},
};

use rstest::rstest;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::yield_now,
    time::{Duration, Instant, advance, timeout},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{AcceptLoopOptions, BackoffConfig, MockAcceptListener, accept_loop};
use crate::{
    demux::ConnectionDemuxer,
    server::{
        DemuxServer,
        test_util::{bind_server, demuxer, free_listener, listener_addr},
    },
};

#[rstest]
#[tokio::test]
async fn run_with_immediate_shutdown(
    demuxer: ConnectionDemuxer,
    free_listener: std::net::TcpListener,
) {
    let server = bind_server(demuxer, free_listener);
    let shutdown_future = async { tokio::time::sleep(Duration::from_millis(10)).await };
    let result = timeout(
        Duration::from_millis(1000),
        server.run_with_shutdown(shutdown_future),
    )
    .await;
    assert!(result.expect("server did not finish in time").is_ok());
}

#[rstest]
#[tokio::test]
async fn ready_signal_fires_after_workers_start(
    demuxer: ConnectionDemuxer,
    free_listener: std::net::TcpListener,
) {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = DemuxServer::new(demuxer)
        .workers(3)
        .ready_signal(ready_tx)
        .bind_existing_listener(free_listener)
        .expect("Failed to bind");
    let handle = tokio::spawn(server.run_with_shutdown(async {
        let _ = stop_rx.await;
    }));

    ready_rx.await.expect("ready signal");
    let _ = stop_tx.send(());
    handle
        .await
        .expect("server join error")
        .expect("server run failed");
}

#[rstest]
#[tokio::test]
async fn accepted_connections_reach_the_demuxer(
    demuxer: ConnectionDemuxer,
    free_listener: std::net::TcpListener,
) {
    let addr = listener_addr(&free_listener);
    let observer = demuxer.clone();
    let (ready_tx, ready_rx) = oneshot::channel();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = bind_server(demuxer, free_listener).ready_signal(ready_tx);
    let handle = tokio::spawn(server.run_with_shutdown(async {
        let _ = stop_rx.await;
    }));
    ready_rx.await.expect("ready signal");

    // A silent client parks in the preamble phase until shutdown.
    let mut client = TcpStream::connect(addr).await.expect("connect");
    client.write_all(&[0x00]).await.expect("write");
    timeout(Duration::from_secs(1), async {
        while observer.task_count() == 0 {
            yield_now().await;
        }
    })
    .await
    .expect("connection task spawned");

    let _ = stop_tx.send(());
    handle
        .await
        .expect("server join error")
        .expect("server run failed");
    assert_eq!(observer.task_count(), 0);
}

#[rstest]
#[tokio::test]
async fn accept_loop_stops_on_shutdown_signal(demuxer: ConnectionDemuxer) {
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let listener = Arc::new(
        TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener"),
    );

    tracker.spawn(accept_loop(
        listener,
        AcceptLoopOptions {
            demuxer,
            shutdown: token.clone(),
            backoff: BackoffConfig::default(),
        },
    ));

    token.cancel();
    tracker.close();

    let result = timeout(Duration::from_millis(100), tracker.wait()).await;
    assert!(result.is_ok());
}

#[rstest]
#[tokio::test]
async fn accept_loop_stops_when_demuxer_shuts_down(demuxer: ConnectionDemuxer) {
    let tracker = TaskTracker::new();
    let listener = Arc::new(
        TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind test listener"),
    );
    demuxer.shutdown().await;

    tracker.spawn(accept_loop(
        listener,
        AcceptLoopOptions {
            demuxer,
            shutdown: CancellationToken::new(),
            backoff: BackoffConfig::default(),
        },
    ));
    tracker.close();

    let result = timeout(Duration::from_millis(100), tracker.wait()).await;
    assert!(result.is_ok());
}

/// Creates a mock listener that fails with exponential backoff tracking.
fn setup_backoff_mock_listener(
    calls: &Arc<Mutex<Vec<Instant>>>,
    num_calls: usize,
) -> MockAcceptListener {
    let mut listener = MockAcceptListener::new();
    let call_log = Arc::clone(calls);
    listener
        .expect_accept()
        .returning(move || {
            let call_log = Arc::clone(&call_log);
            Box::pin(async move {
                call_log.lock().expect("lock").push(Instant::now());
                Err(io::Error::other("mock error"))
            })
        })
        .times(num_calls);
    listener
        .expect_local_addr()
        .returning(|| Ok("127.0.0.1:0".parse().expect("addr parse")))
        .times(num_calls);
    listener
}

/// Validates that recorded call intervals match expected backoff delays.
fn assert_backoff_intervals(
    calls: &[Instant],
    expected: &[Duration],
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let intervals: Vec<_> = calls
        .windows(2)
        .map(|window| {
            let a = window
                .first()
                .ok_or_else(|| "window has first element".to_string())?;
            let b = window
                .get(1)
                .ok_or_else(|| "window has second element".to_string())?;
            b.checked_duration_since(*a)
                .ok_or_else(|| "instants should be monotonically increasing".to_string())
        })
        .collect::<Result<_, _>>()?;

    if intervals.len() != expected.len() {
        return Err(format!(
            "interval count mismatch: got {}, expected {}",
            intervals.len(),
            expected.len()
        )
        .into());
    }

    for (interval, expected) in intervals.into_iter().zip(expected.iter()) {
        if interval != *expected {
            return Err(
                format!("interval mismatch: got {interval:?}, expected {expected:?}").into(),
            );
        }
    }

    Ok(())
}

#[rstest]
#[tokio::test(start_paused = true)]
async fn accept_errors_back_off_exponentially(
    demuxer: ConnectionDemuxer,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let listener = Arc::new(setup_backoff_mock_listener(&calls, 4));
    let token = CancellationToken::new();
    let tracker = TaskTracker::new();
    let backoff = BackoffConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    };

    tracker.spawn(accept_loop(
        listener,
        AcceptLoopOptions {
            demuxer,
            shutdown: token.clone(),
            backoff,
        },
    ));

    yield_now().await;

    let first_call = {
        let calls = calls.lock().expect("lock");
        assert_eq!(calls.len(), 1);
        calls.first().copied().expect("call record missing")
    };

    for ms in [5, 10, 20] {
        advance(Duration::from_millis(ms)).await;
        yield_now().await;
    }

    token.cancel();
    advance(Duration::from_millis(20)).await;
    yield_now().await;
    tracker.close();
    tracker.wait().await;

    let calls = calls.lock().expect("lock");
    assert_eq!(calls.len(), 4);
    let first = calls.first().copied().expect("at least one call logged");
    assert_eq!(first, first_call);
    let expected = [
        Duration::from_millis(5),
        Duration::from_millis(10),
        Duration::from_millis(20),
    ];
    assert_backoff_intervals(&calls, &expected)?;
    Ok(())
}
