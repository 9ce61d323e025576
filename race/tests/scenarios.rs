use commonware_macros::test_traced;
use doublefetch_race::{
    harness::{Harness, Outcome},
    mocks::{self, Backend},
    racer::{self, Racer, State, Step},
    ring::{self, AuxRef, Descriptor},
    trap::{PopulationState, RegionId},
    Endpoint, Error, Kind, Payload, RingChannel, TrapRegion,
};
use std::time::{Duration, Instant};

fn config() -> racer::Config {
    racer::Config {
        region_length: 4096,
        fault_timeout: Duration::from_secs(10),
        completion_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

#[test_traced("DEBUG")]
fn test_scenario_a_zero_payload_completes() {
    let racer = Racer::new(config(), Backend::new(mocks::Config::default()));
    let payload = Payload::zeroed(Endpoint(3), 4096);
    assert_eq!(payload.benign, Kind::RECV);
    assert_eq!(payload.malicious, Kind::SEND);

    let attempt = racer.run(&payload);
    assert_eq!(attempt.state, State::Completed);
    let record = attempt.completion.expect("completion present");
    assert_eq!(Some(record.id), attempt.submission);

    let timeline = attempt.timeline;
    assert!(timeline.fault_seq < timeline.mutate_seq);
    assert!(timeline.mutate_seq < timeline.populate_seq);
}

#[test_traced]
fn test_scenario_b_unarmed_region_fails_fast() {
    // Directly on the region
    let region = TrapRegion::create(4096).unwrap();
    let start = Instant::now();
    assert!(matches!(
        region.wait_for_fault(Duration::from_secs(60)),
        Err(Error::Registration(_))
    ));
    assert!(start.elapsed() < Duration::from_secs(5));

    // Through the harness
    let cfg = racer::Config {
        arm_trap: false,
        fault_timeout: Duration::from_secs(60),
        ..config()
    };
    let start = Instant::now();
    let report = Harness::new(cfg, Backend::new(mocks::Config::default()))
        .run(&Payload::zeroed(Endpoint(3), 4096));
    assert!(start.elapsed() < Duration::from_secs(30));
    assert!(matches!(
        report.outcome,
        Outcome::Aborted {
            step: Step::WaitForFault,
            ..
        }
    ));
    assert_ne!(report.exit_code(), 0);
}

#[test_traced]
fn test_scenario_c_populate_twice() {
    let region = TrapRegion::create(10).unwrap();
    let buffer = *b"0123456789";
    region.populate(None, &buffer).unwrap();
    assert!(matches!(
        region.populate(None, &buffer),
        Err(Error::AlreadyPopulated)
    ));
    assert_eq!(region.population(), PopulationState::Populated);
    assert_eq!(region.contents().unwrap().as_ref(), &buffer);
}

#[test_traced]
fn test_scenario_d_channel_full() {
    let (mut ring, _consumer) = RingChannel::new(ring::Config { entries: 8 }).unwrap();
    let capacity = ring.capacity();
    assert_eq!(capacity, 8);
    let descriptor = Descriptor {
        kind: Kind::NOP,
        endpoint: Endpoint(0),
        auxiliary: AuxRef {
            region: RegionId(0),
            offset: 0,
            len: 0,
        },
    };
    for _ in 0..capacity {
        ring.submit(descriptor).unwrap();
    }
    assert!(matches!(ring.submit(descriptor), Err(Error::ChannelFull)));
}

#[test_traced]
fn test_fixed_backend_is_blocked() {
    let backend = Backend::new(mocks::Config {
        double_fetch: false,
        ..Default::default()
    });
    let report = Harness::new(config(), backend.clone()).run(&Payload::new(
        Kind::RECV,
        Kind::SEND,
        Endpoint(3),
        mocks::message(b"ping", 4096).unwrap(),
    ));
    assert_eq!(report.outcome, Outcome::Blocked);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(backend.executions()[0].executed, Kind::RECV);
}

#[test_traced]
fn test_unraced_send_is_blocked() {
    // Submitting the privileged kind directly never reaches the worker context
    let report = Harness::new(config(), Backend::new(mocks::Config::default())).run(
        &Payload::new(
            Kind::SEND,
            Kind::SEND,
            Endpoint(3),
            mocks::message(b"ping", 4096).unwrap(),
        ),
    );
    assert_eq!(report.outcome, Outcome::Blocked);
    assert_eq!(report.status, Some(-libc::EPERM));
}

#[test_traced]
fn test_repeated_attempts_reuse_backend() {
    let backend = Backend::new(mocks::Config::default());
    let racer = Racer::new(config(), backend.clone());
    for _ in 0..3 {
        let attempt = racer.run(&Payload::zeroed(Endpoint(3), 4096));
        assert_eq!(attempt.state, State::Completed);
    }
    assert_eq!(backend.executions().len(), 3);
}
