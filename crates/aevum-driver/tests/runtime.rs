//! End-to-end runtime scenarios, driven through the public surface with a
//! hand-scripted firmware.

mod common;

use std::sync::Arc;
use std::time::Duration;

use aevum_driver::{
    AevumError, Emulator, LogCrashReporter, NetworkSpec, PmuConfig, Status,
};
use aevum_proto::{
    CancelInferenceRsp, InferenceRsp, Message, MsgType, VersionRsp, VERSION_MINOR,
};
use common::{wait_for, Harness, Responder, TestTransport};

#[test]
fn happy_path_inference() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();

    let ifm = session.buffer_create(256).unwrap();
    let ofm = session.buffer_create(256).unwrap();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();

    let job = network
        .inference(&session, &[ifm.clone()], &[ofm.clone()], &PmuConfig::default())
        .unwrap();

    // The request is on the wire with a fresh correlation id.
    assert_eq!(h.transport.sent_count(), 1);
    let request = h.transport.last_packet();
    assert_eq!(request.msg.msg_type(), MsgType::InferenceReq);
    assert_eq!(job.status().status, Status::Running);
    assert!(!job.is_done());

    let mut rsp = InferenceRsp {
        ofm_count: 1,
        status: Status::Ok as u32,
        pmu_event_count: [10, 20, 30, 40, 0, 0, 0, 0],
        pmu_cycle_counter_enable: 1,
        pmu_cycle_counter_count: 12345,
        ..InferenceRsp::default()
    };
    rsp.ofm_size[0] = 256;
    h.inject(request.msg_id, &Message::InferenceRsp(Box::new(rsp)));

    assert!(job.is_done());
    assert!(job.wait(Duration::from_millis(10)));
    let status = job.status();
    assert_eq!(status.status, Status::Ok);
    assert_eq!(status.pmu_event_count, [10, 20, 30, 40]);
    assert!(status.cycle_counter_enable);
    assert_eq!(status.cycle_counter_count, 12345);
    assert_eq!(status.ofm_sizes, vec![256]);
    assert_eq!(h.reporter.count(), 0);
}

#[test]
fn version_mismatch_aborts_startup() {
    let h = Harness::new(TestTransport::unlimited());

    let _responder = Responder::spawn(
        h.device.clone(),
        h.transport.clone(),
        |request| match request.msg {
            Message::VersionReq => Some(Message::VersionRsp(VersionRsp {
                major: 0,
                minor: VERSION_MINOR.wrapping_sub(1),
                patch: 0,
            })),
            _ => panic!("unexpected request after failed version check"),
        },
    );

    let err = h.device.probe().unwrap_err();
    assert!(matches!(err, AevumError::ProtocolError { .. }));

    // The capabilities request was never sent.
    assert_eq!(h.transport.sent_count(), 1);
}

#[test]
fn patch_difference_is_accepted() {
    let h = Harness::new(TestTransport::unlimited());

    let _responder = Responder::spawn(
        h.device.clone(),
        h.transport.clone(),
        |request| match request.msg {
            Message::VersionReq => Some(Message::VersionRsp(VersionRsp {
                major: aevum_proto::VERSION_MAJOR,
                minor: aevum_proto::VERSION_MINOR,
                patch: aevum_proto::VERSION_PATCH.wrapping_add(3),
            })),
            Message::CapabilitiesReq => {
                Some(Message::CapabilitiesRsp(aevum_proto::CapabilitiesRsp {
                    macs_per_cc: 128,
                    ..aevum_proto::CapabilitiesRsp::default()
                }))
            }
            _ => None,
        },
    );

    h.device.probe().unwrap();
    let session = h.device.open();
    assert_eq!(session.capabilities().unwrap().macs_per_cc, 128);
}

#[test]
fn cancel_races_completion() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();

    let ifm = session.buffer_create(64).unwrap();
    let ofm = session.buffer_create(64).unwrap();
    let network = session.network_create(NetworkSpec::Index(1)).unwrap();
    let job = network
        .inference(&session, &[ifm], &[ofm], &PmuConfig::default())
        .unwrap();
    let inference_id = h.transport.last_packet().msg_id;

    // Cancel from a second task; it blocks awaiting the firmware.
    let cancel_job = job.clone();
    let cancel_session = session.clone();
    let canceller = std::thread::spawn(move || cancel_job.cancel(&cancel_session));

    wait_for(Duration::from_secs(2), "cancel request on the wire", || {
        h.transport.sent_count() == 2
    });
    let cancel_request = h.transport.last_packet();
    assert_eq!(cancel_request.msg.msg_type(), MsgType::CancelInferenceReq);
    assert_eq!(job.status().status, Status::Aborting);

    // The inference completes OK while the cancellation is in flight; the
    // abort latch must win.
    h.inject(
        inference_id,
        &Message::InferenceRsp(Box::new(InferenceRsp {
            status: Status::Ok as u32,
            ..InferenceRsp::default()
        })),
    );
    assert!(job.is_done());
    assert_eq!(job.status().status, Status::Aborted);

    h.inject(
        cancel_request.msg_id,
        &Message::CancelInferenceRsp(CancelInferenceRsp {
            status: Status::Ok as u32,
        }),
    );

    assert_eq!(canceller.join().unwrap().unwrap(), Status::Ok);
    assert_eq!(job.status().status, Status::Aborted);
    assert_eq!(h.reporter.count(), 0);
}

#[test]
fn cancel_timeout_reports_crash() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();

    let ifm = session.buffer_create(64).unwrap();
    let ofm = session.buffer_create(64).unwrap();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();
    let job = network
        .inference(&session, &[ifm.clone()], &[ofm.clone()], &PmuConfig::default())
        .unwrap();

    // Firmware never answers the cancellation.
    let outcome = job.cancel(&session);
    assert!(matches!(outcome, Err(AevumError::Timeout { .. })));
    assert_eq!(h.reporter.count(), 1);

    // The subsequent crash teardown fails the inference into Aborted.
    h.device.teardown();
    assert!(job.is_done());
    assert_eq!(job.status().status, Status::Aborted);

    // All handle references unwind once the job handle drops.
    drop(job);
    assert_eq!(ifm.handle_count(), 1);
    assert_eq!(ofm.handle_count(), 1);
    assert_eq!(network.handle_count(), 1);
}

#[test]
fn teardown_fails_outstanding_requests() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();

    // Three requests in flight, no firmware replies.
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let net = network.clone();
            let sess = session.clone();
            std::thread::spawn(move || net.info(&sess))
        })
        .collect();

    wait_for(Duration::from_secs(2), "three requests on the wire", || {
        h.transport.sent_count() == 3
    });

    h.device.teardown();

    // Every waiter observes completion with an error, exactly once each.
    for waiter in waiters {
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, AevumError::Faulted { .. }), "got {err:?}");
    }

    // Post-shutdown registration is refused.
    assert_eq!(network.info(&session).unwrap_err(), AevumError::NoDevice);
    assert_eq!(session.ping().unwrap_err(), AevumError::NoDevice);
}

#[test]
fn fd_limit_is_enforced_without_side_effects() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();

    let buffers: Vec<_> = (0..17)
        .map(|_| session.buffer_create(16).unwrap())
        .collect();
    let ofm = session.buffer_create(16).unwrap();
    let network = session.network_create(NetworkSpec::Index(0)).unwrap();

    let err = network
        .inference(&session, &buffers, &[ofm.clone()], &PmuConfig::default())
        .unwrap_err();
    assert!(matches!(err, AevumError::Faulted { .. }));

    // Nothing was sent, and no buffer references were taken.
    assert_eq!(h.transport.sent_count(), 0);
    assert!(buffers.iter().all(|b| b.handle_count() == 1));
    assert_eq!(ofm.handle_count(), 1);

    // No correlation id was consumed either: the next request gets id 0.
    let job = network
        .inference(&session, &buffers[..1], &[ofm], &PmuConfig::default())
        .unwrap();
    assert_eq!(h.transport.last_packet().msg_id, 0);
    drop(job);
}

#[test]
fn rejected_inference_is_a_normal_outcome() {
    let h = Harness::new(TestTransport::unlimited());
    let session = h.device.open();
    let ifm = session.buffer_create(32).unwrap();
    let ofm = session.buffer_create(32).unwrap();
    let network = session.network_create(NetworkSpec::Index(9)).unwrap();

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

    assert_eq!(job.status().status, Status::Rejected);
    assert_eq!(h.reporter.count(), 0);
}

#[test]
fn firmware_error_packet_reports_crash() {
    let h = Harness::new(TestTransport::unlimited());

    h.inject(
        0,
        &Message::Err(aevum_proto::ErrMsg::new(
            aevum_proto::err_type::INVALID_PAYLOAD,
            "inference payload rejected",
        )),
    );
    assert_eq!(h.reporter.count(), 1);

    // Malformed packets are rejected without reaching the crash path.
    assert!(h.device.on_packet(&[0u8; 4]).is_err());
    let mut bad_magic = aevum_proto::wire::encode(0, &Message::Pong);
    bad_magic[0] ^= 0xff;
    assert!(matches!(
        h.device.on_packet(&bad_magic).unwrap_err(),
        AevumError::BadMessage { .. }
    ));
    assert_eq!(h.reporter.count(), 1);
}

#[test]
fn full_stack_against_emulator() {
    let firmware = Emulator::with_defaults();
    let dma = Arc::new(aevum_driver::CarveoutAllocator::new(0x6000_0000, 1 << 20).unwrap());
    let device = Arc::new(
        aevum_driver::AevumDevice::new(firmware.transport(), dma, Box::new(LogCrashReporter))
            .unwrap(),
    );
    firmware.connect(&device);
    device.probe().unwrap();

    let session = device.open();
    session.ping().unwrap();

    let network = session.network_create(NetworkSpec::Index(0)).unwrap();
    let info = network.info(&session).unwrap();
    assert_eq!(info.desc, "emulated");
    assert_eq!(info.ifm_sizes, vec![784]);
    assert_eq!(info.ofm_sizes, vec![10]);

    let ifm = session.buffer_create(784).unwrap();
    let ofm = session.buffer_create(10).unwrap();
    ifm.map().write(0, &[1u8; 784]).unwrap();

    let pmu = PmuConfig {
        events: [1, 2, 0, 0],
        cycle_counter: true,
    };
    let job = network.inference(&session, &[ifm], &[ofm], &pmu).unwrap();
    assert!(job.wait(Duration::from_secs(2)));

    let status = job.status();
    assert_eq!(status.status, Status::Ok);
    assert_eq!(status.ofm_sizes, vec![10]);
    assert!(status.cycle_counter_enable);
    assert_eq!(status.cycle_counter_count, 12345);
    assert_eq!(status.pmu_event_count[0], 10);
    assert_eq!(status.pmu_event_count[1], 20);
}
