//! Quantified invariants of the correlation and resource-lifetime engine.

mod common;

use std::time::Duration;

use aevum_driver::{AevumError, NetworkSpec, PmuConfig, Status};
use aevum_proto::{wire, InferenceRsp, Message, NetworkInfoRsp};
use common::{wait_for, Harness, TestTransport};

/// A response whose correlation id exists but whose type disagrees with
/// the registered request is dropped, and the entry stays registered.
#[test]
fn kind_isolation() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();
    let ifm = session.buffer_create(32).unwrap();
    let ofm = session.buffer_create(32).unwrap();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();

    let job = network
        .inference(&session, &[ifm], &[ofm], &PmuConfig::default())
        .unwrap();
    let id = h.transport.last_packet().msg_id;

    // Same id, wrong response type: logged and dropped, no state change.
    h.inject(
        id,
        &Message::NetworkInfoRsp(Box::new(NetworkInfoRsp::default())),
    );
    assert!(!job.is_done());
    assert_eq!(job.status().status, Status::Running);

    // The real response still lands on the intact entry.
    h.inject(
        id,
        &Message::InferenceRsp(Box::new(InferenceRsp {
            status: Status::Ok as u32,
            ..InferenceRsp::default()
        })),
    );
    assert!(job.is_done());
    assert_eq!(job.status().status, Status::Ok);
}

/// Correlation ids increase monotonically and skip live registrations,
/// so no two outstanding requests ever share an id.
#[test]
fn correlation_ids_never_collide() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();
    let ifm = session.buffer_create(16).unwrap();
    let ofm = session.buffer_create(16).unwrap();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();

    let mut ids = Vec::new();
    let mut jobs = Vec::new();
    for _ in 0..8 {
        let job = network
            .inference(&session, &[ifm.clone()], &[ofm.clone()], &PmuConfig::default())
            .unwrap();
        ids.push(h.transport.last_packet().msg_id);
        jobs.push(job);
    }

    let mut deduped = ids.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), ids.len(), "duplicate correlation id");

    // Ids of still-registered inferences are skipped: completing and
    // dropping job 0 does not make a new request reuse its id.
    h.inject(
        ids[0],
        &Message::InferenceRsp(Box::new(InferenceRsp {
            status: Status::Ok as u32,
            ..InferenceRsp::default()
        })),
    );
    jobs.remove(0);
    let job = network
        .inference(&session, &[ifm.clone()], &[ofm.clone()], &PmuConfig::default())
        .unwrap();
    let fresh = h.transport.last_packet().msg_id;
    assert!(!ids.contains(&fresh), "freed id reused before wraparound");
    drop(job);
}

/// Buffer handle counts return to one after every inference that used
/// them has completed and dropped.
#[test]
fn refcount_conservation() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();
    let ifm = session.buffer_create(64).unwrap();
    let ofm = session.buffer_create(64).unwrap();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();

    let mut jobs = Vec::new();
    for _ in 0..5 {
        jobs.push(
            network
                .inference(&session, &[ifm.clone()], &[ofm.clone()], &PmuConfig::default())
                .unwrap(),
        );
    }
    // One base handle plus one per inference.
    assert_eq!(ifm.handle_count(), 6);
    assert_eq!(ofm.handle_count(), 6);
    assert_eq!(network.handle_count(), 6);

    for n in 0..5 {
        h.inject(
            h.transport.sent_packet(n).msg_id,
            &Message::InferenceRsp(Box::new(InferenceRsp {
                status: Status::Ok as u32,
                ..InferenceRsp::default()
            })),
        );
    }
    jobs.clear();

    assert_eq!(ifm.handle_count(), 1);
    assert_eq!(ofm.handle_count(), 1);
    assert_eq!(network.handle_count(), 1);
}

/// `done` is monotonic and terminal status never changes, even under a
/// duplicate (stale) response.
#[test]
fn status_is_terminal_once_done() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();
    let ifm = session.buffer_create(16).unwrap();
    let ofm = session.buffer_create(16).unwrap();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();
    let job = network
        .inference(&session, &[ifm], &[ofm], &PmuConfig::default())
        .unwrap();
    let id = h.transport.last_packet().msg_id;

    h.inject(
        id,
        &Message::InferenceRsp(Box::new(InferenceRsp {
            status: Status::Rejected as u32,
            ..InferenceRsp::default()
        })),
    );
    assert!(job.is_done());
    assert_eq!(job.status().status, Status::Rejected);

    // A duplicate response for the same id is dropped.
    h.inject(
        id,
        &Message::InferenceRsp(Box::new(InferenceRsp {
            status: Status::Ok as u32,
            ..InferenceRsp::default()
        })),
    );
    assert!(job.is_done());
    assert_eq!(job.status().status, Status::Rejected);
}

/// With N tasks blocked on send and M slots freed over time, exactly
/// min(N, M) sends complete; one wakeup serves one slot.
#[test]
fn send_is_fair_and_slot_bounded() {
    let h = Harness::new(TestTransport::with_slots(0));
    let session = h.device.open();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();

    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let net = network.clone();
            let sess = session.clone();
            std::thread::spawn(move || net.info(&sess))
        })
        .collect();

    // All three are parked: nothing can be sent with zero slots.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.transport.sent_count(), 0);

    for round in 1..=3u64 {
        h.transport.add_slots(1);
        // An inbound packet signals that a slot may have freed.
        h.inject(0, &Message::Pong);
        wait_for(Duration::from_secs(2), "one more send per slot", || {
            h.transport.sent_count() == round as usize
        });
        assert_eq!(h.transport.sent_count(), round as usize);

        // Answer the request so the waiter finishes cleanly.
        let request = h.transport.last_packet();
        h.inject(
            request.msg_id,
            &Message::NetworkInfoRsp(Box::new(NetworkInfoRsp {
                ifm_count: 0,
                ofm_count: 0,
                status: Status::Ok as u32,
                ..NetworkInfoRsp::default()
            })),
        );
    }

    for waiter in waiters {
        assert!(waiter.join().unwrap().is_ok());
    }
}

/// Interrupting a session aborts its blocked send; other sessions keep
/// their place in the queue.
#[test]
fn interrupt_aborts_blocked_send() {
    let h = Harness::new(TestTransport::with_slots(0));
    let session_a = h.device.open();
    let session_b = h.device.open();
    let network = h
        .device
        .open()
        .network_create(NetworkSpec::Index(0))
        .unwrap();

    let net_a = network.clone();
    let sess_a = session_a.clone();
    let blocked_a = std::thread::spawn(move || net_a.info(&sess_a));
    std::thread::sleep(Duration::from_millis(20));

    let net_b = network.clone();
    let sess_b = session_b.clone();
    let blocked_b = std::thread::spawn(move || net_b.info(&sess_b));
    std::thread::sleep(Duration::from_millis(20));

    session_a.interrupt();
    assert_eq!(blocked_a.join().unwrap().unwrap_err(), AevumError::Interrupted);

    // Session B proceeds once a slot frees.
    h.transport.add_slots(1);
    h.inject(0, &Message::Pong);
    wait_for(Duration::from_secs(2), "second waiter sends", || {
        h.transport.sent_count() == 1
    });
    let request = h.transport.last_packet();
    h.inject(
        request.msg_id,
        &Message::NetworkInfoRsp(Box::new(NetworkInfoRsp {
            ifm_count: 0,
            ofm_count: 0,
            status: Status::Ok as u32,
            ..NetworkInfoRsp::default()
        })),
    );
    assert!(blocked_b.join().unwrap().is_ok());
}

/// Late responses — the waiter timed out and deregistered — are logged
/// and dropped without completing anyone.
#[test]
fn late_response_is_discarded() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();

    let err = network.info(&session).unwrap_err();
    assert!(matches!(err, AevumError::Timeout { .. }));
    let id = h.transport.last_packet().msg_id;

    // The response arrives after deregistration; the dispatcher drops it.
    let pkt = wire::encode(
        id,
        &Message::NetworkInfoRsp(Box::new(NetworkInfoRsp::default())),
    );
    assert!(h.device.on_packet(&pkt).is_ok());
}
