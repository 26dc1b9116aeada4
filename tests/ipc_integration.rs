//! End-to-end delivery over the named-pipe transport.
//!
//! Workers are simulated inside the test process: each gets its own
//! `IpcTransport` attached to a slot, under a pid registered in the pool.

#![cfg(unix)]

mod common;

use std::time::Duration;

use alertbus::bus::ipc::{IpcPool, IpcPoolConfig, IpcTransport};
use alertbus::bus::{handler_fn, HandlerError};
use alertbus::{AlertBus, AlertError, BroadcastScope, BusConfig};
use tempfile::TempDir;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use common::{capture_logs, Recorder};

const BASE_PID: i32 = 40_000;

fn ipc_buses(
    workers: usize,
    config: BusConfig,
) -> (TempDir, IpcPool, Vec<AlertBus<IpcTransport>>) {
    let dir = TempDir::new().unwrap();
    let mut pool = IpcPool::new(IpcPoolConfig::new(dir.path(), workers)).unwrap();
    let buses = (0..workers as u32)
        .map(|slot| {
            let pid = BASE_PID + slot as i32;
            pool.register_worker(slot, pid).unwrap();
            let transport =
                IpcTransport::with_pid(pool.descriptor().clone(), slot, pid).unwrap();
            AlertBus::new(transport, config.clone())
        })
        .collect();
    (dir, pool, buses)
}

#[test]
fn alerts_cross_pipes_with_sender_identity() {
    let (_dir, _pool, buses) = ipc_buses(3, BusConfig::default());
    let recorder = Recorder::new();
    buses[2].register("hello", recorder.handler());

    buses[0].send_by_pid(BASE_PID + 2, "hello", b"\x00from zero").unwrap();
    buses[1].send_by_slot(2, "hello", b"from one").unwrap();
    buses[2].poll().unwrap();

    let calls = recorder.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].sender.pid, BASE_PID);
    assert_eq!(calls[0].sender.slot, 0);
    assert_eq!(calls[0].payload(), b"\x00from zero");
    assert_eq!(calls[1].sender.slot, 1);
}

#[test]
fn broadcast_scope_controls_self_delivery() {
    for (scope, expected_self) in [
        (BroadcastScope::IncludeSelf, 1),
        (BroadcastScope::ExcludeSelf, 0),
    ] {
        let (_dir, _pool, buses) = ipc_buses(4, BusConfig { broadcast: scope });
        let recorders: Vec<Recorder> = buses
            .iter()
            .map(|bus| {
                let recorder = Recorder::new();
                bus.register("shutdown_prep", recorder.handler());
                recorder
            })
            .collect();

        buses[1].broadcast("shutdown_prep", b"").unwrap();
        for bus in &buses {
            bus.poll().unwrap();
        }

        assert_eq!(recorders[1].count(), expected_self);
        for (slot, recorder) in recorders.iter().enumerate() {
            if slot != 1 {
                assert_eq!(recorder.count(), 1);
            }
        }
    }
}

#[test]
fn unknown_targets_and_oversized_alerts_fail_fast() {
    let (_dir, _pool, buses) = ipc_buses(2, BusConfig::default());
    let bus = &buses[0];

    assert!(matches!(
        bus.send_by_slot(99, "x", b""),
        Err(AlertError::UnknownTarget(_))
    ));
    assert!(matches!(
        bus.send_by_pid(1, "x", b""),
        Err(AlertError::UnknownTarget(_))
    ));

    let err = bus.send_by_slot(1, "big", &vec![0u8; 8192]).unwrap_err();
    assert!(matches!(err, AlertError::Transport(_)));
    assert!(bus.last_error().contains("exceeds limit"));
}

#[test]
fn worker_that_left_is_unknown_target() {
    let (_dir, mut pool, mut buses) = ipc_buses(2, BusConfig::default());
    drop(buses.pop());
    pool.unregister_worker(1).unwrap();

    let err = buses[0].send_by_slot(1, "x", b"").unwrap_err();
    assert!(matches!(err, AlertError::UnknownTarget(_)));
    assert_eq!(buses[0].directory().list_other_live_pids(), Vec::<i32>::new());
}

#[test]
fn handler_failure_is_isolated() {
    let (_dir, _pool, buses) = ipc_buses(2, BusConfig::default());
    let ping = Recorder::new();
    buses[1].register("boom", handler_fn(|_| Err(HandlerError::new("bad state"))));
    buses[1].register("ping", ping.handler());

    buses[0].send_by_slot(1, "boom", b"x").unwrap();
    buses[0].send_by_slot(1, "ping", b"y").unwrap();
    let (stats, logs) = capture_logs(|| buses[1].poll().unwrap());

    assert_eq!(stats.failed, 1);
    assert_eq!(stats.delivered, 1);
    assert!(logs.contains("boom"));
    assert_eq!(ping.count(), 1);
}

#[tokio::test(flavor = "current_thread")]
async fn pipe_readiness_drives_dispatch() {
    let (_dir, _pool, buses) = ipc_buses(2, BusConfig::default());
    let mut buses = buses.into_iter();
    let sender = buses.next().unwrap();
    let receiver = buses.next().unwrap();

    let recorder = Recorder::new();
    receiver.register("wake", recorder.handler());
    let readable =
        AsyncFd::with_interest(receiver.transport().reader_fd(), Interest::READABLE).unwrap();

    sender.send_by_slot(1, "wake", b"up").unwrap();

    let mut guard = tokio::time::timeout(Duration::from_secs(5), readable.readable())
        .await
        .expect("pipe never became readable")
        .unwrap();
    guard.clear_ready();
    receiver.poll().unwrap();

    assert_eq!(recorder.count(), 1);
}
