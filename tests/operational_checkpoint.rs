mod support;

use std::time::{Duration, Instant};

use constor::dispatch::Request;
use constor::error::ErrorCode;
use constor::session::UserCredentials;
use constor::subscription::{DeliveryAddress, EventFilter, Subscription, SubscriptionKind};
use constor::value::{Datastore, Value, ValueData};
use tempfile::TempDir;

use support::{builder, install_fixture_modules, short_timeouts, ProviderTransport};

fn operational_subscription() -> Subscription {
    Subscription {
        module: "iface-module".into(),
        xpath: Some("/iface-module:stats".into()),
        kind: SubscriptionKind::OperationalData,
        delivery: DeliveryAddress {
            address: "unix:/tmp/stats-provider.sock".into(),
            id: 1,
        },
        priority: 0,
        event_filter: EventFilter::Both,
        enables_running: false,
    }
}

const COUNTER: &str = "/iface-module:stats/counter[name='rx']/value";

#[test]
fn read_waits_for_provider_data_and_merges_it() {
    let tmp = TempDir::new().unwrap();
    let transport = ProviderTransport::new();
    let engine = builder(tmp.path())
        .timeouts(short_timeouts())
        .transport(transport.clone())
        .build()
        .unwrap();
    install_fixture_modules(&engine);

    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Running);
    engine
        .subscribe(session, operational_subscription())
        .unwrap();
    transport.attach(&engine, session);
    transport.serve(
        vec![Value::new(COUNTER, ValueData::Uint64(42))],
        Duration::from_millis(20),
    );

    let rx = engine.submit(
        Some(session),
        Request::GetItems {
            xpath: COUNTER.into(),
        },
    );
    let response = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(response.code, ErrorCode::Ok);
    assert_eq!(response.values.len(), 1);
    assert_eq!(response.values[0].data, ValueData::Uint64(42));
}

#[test]
fn provider_timeout_completes_the_read_with_what_arrived() {
    let tmp = TempDir::new().unwrap();
    let transport = ProviderTransport::new();
    let engine = builder(tmp.path())
        .timeouts(short_timeouts())
        .transport(transport.clone())
        .build()
        .unwrap();
    install_fixture_modules(&engine);

    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Running);
    engine
        .subscribe(session, operational_subscription())
        .unwrap();
    transport.attach(&engine, session);
    transport.go_silent();

    let started = Instant::now();
    let rx = engine.submit(
        Some(session),
        Request::GetItems {
            xpath: COUNTER.into(),
        },
    );
    // The read is never dropped: it completes once the wait deadline fires,
    // here with nothing merged.
    let response = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(response.code, ErrorCode::NotFound);
    assert!(started.elapsed() < Duration::from_secs(2));

    let snapshot = engine.metrics_snapshot();
    assert_eq!(snapshot.counter("constor.provider.timeouts"), 1);
}

#[test]
fn late_provider_answers_are_ignored_after_timeout() {
    let tmp = TempDir::new().unwrap();
    let transport = ProviderTransport::new();
    let engine = builder(tmp.path())
        .timeouts(short_timeouts())
        .transport(transport.clone())
        .build()
        .unwrap();
    install_fixture_modules(&engine);

    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Running);
    engine
        .subscribe(session, operational_subscription())
        .unwrap();
    transport.attach(&engine, session);
    // Answer far beyond the 200ms wait deadline.
    transport.serve(
        vec![Value::new(COUNTER, ValueData::Uint64(7))],
        Duration::from_millis(600),
    );

    let rx = engine.submit(
        Some(session),
        Request::GetItems {
            xpath: COUNTER.into(),
        },
    );
    let response = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(response.code, ErrorCode::NotFound);

    // The session is healthy afterwards; the stale response did not wedge
    // its state machine.
    std::thread::sleep(Duration::from_millis(700));
    let rx = engine.submit(
        Some(session),
        Request::SetItem {
            xpath: "/iface-module:interfaces/interface[name='eth0']/mtu".into(),
            value: Some(ValueData::Uint32(1500)),
            flags: constor::data::EditFlags::DEFAULT,
        },
    );
    let response = rx.recv_timeout(Duration::from_secs(3)).unwrap();
    assert_eq!(response.code, ErrorCode::Ok);
}
