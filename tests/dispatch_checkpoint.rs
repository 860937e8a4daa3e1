mod support;

use std::time::Duration;

use constor::data::EditFlags;
use constor::dispatch::Request;
use constor::error::ErrorCode;
use constor::session::UserCredentials;
use constor::value::{Datastore, ValueData};
use tempfile::TempDir;

use support::engine;

const LEAF: &str = "/example-module:container/list[key1='a'][key2='b']/leaf";

fn recv(rx: std::sync::mpsc::Receiver<constor::dispatch::Response>) -> constor::dispatch::Response {
    rx.recv_timeout(Duration::from_secs(5)).expect("response")
}

#[test]
fn requests_flow_through_the_worker_pool() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);

    let set = recv(engine.submit(
        Some(session),
        Request::SetItem {
            xpath: LEAF.into(),
            value: Some(ValueData::String("queued".into())),
            flags: EditFlags::DEFAULT,
        },
    ));
    assert_eq!(set.code, ErrorCode::Ok);

    let commit = recv(engine.submit(Some(session), Request::Commit));
    assert_eq!(commit.code, ErrorCode::Ok);

    let reader = engine.session_start(UserCredentials::new("bob"), Datastore::Startup);
    let get = recv(engine.submit(
        Some(reader),
        Request::GetItem { xpath: LEAF.into() },
    ));
    assert_eq!(get.code, ErrorCode::Ok);
    assert_eq!(get.values[0].data, ValueData::String("queued".into()));
}

#[test]
fn request_without_a_session_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let response = recv(engine.submit(None, Request::GetItem { xpath: LEAF.into() }));
    assert_eq!(response.code, ErrorCode::InvalidArg);
}

#[test]
fn errors_come_back_as_response_payloads() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);
    let response = recv(engine.submit(
        Some(session),
        Request::GetItem {
            xpath: "/ghost-module:nothing".into(),
        },
    ));
    assert_eq!(response.code, ErrorCode::UnknownModel);
    assert!(!response.errors.is_empty());
}

#[test]
fn burst_of_requests_from_one_session_serializes() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);

    let receivers: Vec<_> = (0..30)
        .map(|i| {
            engine.submit(
                Some(session),
                Request::SetItem {
                    xpath: format!(
                        "/example-module:container/list[key1='k{i}'][key2='x']/leaf"
                    ),
                    value: Some(ValueData::String(format!("v{i}"))),
                    flags: EditFlags::DEFAULT,
                },
            )
        })
        .collect();
    for rx in receivers {
        assert_eq!(recv(rx).code, ErrorCode::Ok);
    }
    let commit = recv(engine.submit(Some(session), Request::Commit));
    assert_eq!(commit.code, ErrorCode::Ok);

    let reader = engine.session_start(UserCredentials::new("bob"), Datastore::Startup);
    let list = recv(engine.submit(
        Some(reader),
        Request::GetItems {
            xpath: "/example-module:container/list".into(),
        },
    ));
    assert_eq!(list.values.len(), 30);
}

#[test]
fn lock_requests_round_trip_through_the_queue() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let a = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);
    let b = engine.session_start(UserCredentials::new("bob"), Datastore::Startup);

    let lock = recv(engine.submit(
        Some(a),
        Request::LockModule {
            module: "example-module".into(),
        },
    ));
    assert_eq!(lock.code, ErrorCode::Ok);

    let conflict = recv(engine.submit(
        Some(b),
        Request::LockModule {
            module: "example-module".into(),
        },
    ));
    assert_eq!(conflict.code, ErrorCode::Locked);

    let unlock = recv(engine.submit(
        Some(a),
        Request::UnlockModule {
            module: "example-module".into(),
        },
    ));
    assert_eq!(unlock.code, ErrorCode::Ok);
}
