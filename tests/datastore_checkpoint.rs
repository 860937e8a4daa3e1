mod support;

use constor::data::EditFlags;
use constor::error::EngineError;
use constor::session::UserCredentials;
use constor::value::{Datastore, ValueData};
use tempfile::TempDir;

use support::{engine, string_value};

const LEAF: &str = "/example-module:container/list[key1='a'][key2='b']/leaf";

#[test]
fn set_commit_get_across_sessions() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());

    let writer = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);
    engine
        .set_item(writer, LEAF, string_value("v"), EditFlags::DEFAULT)
        .unwrap();
    engine.commit(writer).unwrap();

    let reader = engine.session_start(UserCredentials::new("bob"), Datastore::Startup);
    let value = engine.get_item(reader, LEAF).unwrap();
    assert_eq!(value.data, ValueData::String("v".into()));
    assert_eq!(value.xpath, LEAF);
}

#[test]
fn strict_violations_report_exists_and_missing() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);

    engine
        .set_item(session, LEAF, string_value("v"), EditFlags::DEFAULT)
        .unwrap();
    let exists = engine
        .set_item(session, LEAF, string_value("w"), EditFlags::STRICT)
        .unwrap_err();
    assert!(matches!(exists, EngineError::DataExists(_)));

    let other = "/example-module:container/list[key1='x'][key2='y']/leaf";
    let missing = engine
        .delete_item(session, other, EditFlags::STRICT)
        .unwrap_err();
    assert!(matches!(missing, EngineError::DataMissing(_)));
    // The failed edits must not survive in the log: a commit carries only
    // the successful set.
    engine.commit(session).unwrap();
    let value = engine.get_item(session, LEAF).unwrap();
    assert_eq!(value.data, ValueData::String("v".into()));
}

#[test]
fn uncommitted_edits_are_invisible_to_other_sessions() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());

    let a = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);
    let b = engine.session_start(UserCredentials::new("bob"), Datastore::Startup);

    engine
        .set_item(a, LEAF, string_value("draft"), EditFlags::DEFAULT)
        .unwrap();
    let hidden = engine.get_item(b, LEAF);
    assert!(matches!(hidden, Err(EngineError::NotFound(_))));

    engine.commit(a).unwrap();
    // B still holds its pre-commit view until it refreshes.
    assert!(engine.get_item(b, LEAF).is_err());
    engine.refresh(b).unwrap();
    let value = engine.get_item(b, LEAF).unwrap();
    assert_eq!(value.data, ValueData::String("draft".into()));
}

#[test]
fn discard_changes_drops_the_working_copy_and_log() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);

    engine
        .set_item(session, LEAF, string_value("throwaway"), EditFlags::DEFAULT)
        .unwrap();
    engine.discard_changes(session).unwrap();
    assert!(engine.get_item(session, LEAF).is_err());
    // Nothing left to commit.
    assert_eq!(engine.commit(session).unwrap(), None);
}

#[test]
fn concurrent_edits_rebase_through_replay() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let a = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);
    let b = engine.session_start(UserCredentials::new("bob"), Datastore::Startup);

    let leaf_a = "/example-module:container/list[key1='a'][key2='k']/leaf";
    let leaf_b = "/example-module:container/list[key1='b'][key2='k']/leaf";
    engine
        .set_item(a, leaf_a, string_value("from-a"), EditFlags::DEFAULT)
        .unwrap();
    engine
        .set_item(b, leaf_b, string_value("from-b"), EditFlags::DEFAULT)
        .unwrap();

    engine.commit(a).unwrap();
    // B's copy is now stale; its commit replays the log over the new base.
    engine.commit(b).unwrap();

    let reader = engine.session_start(UserCredentials::new("carol"), Datastore::Startup);
    assert_eq!(
        engine.get_item(reader, leaf_a).unwrap().data,
        ValueData::String("from-a".into())
    );
    assert_eq!(
        engine.get_item(reader, leaf_b).unwrap().data,
        ValueData::String("from-b".into())
    );
}

#[test]
fn startup_data_survives_an_engine_restart() {
    let tmp = TempDir::new().unwrap();
    {
        let engine = engine(tmp.path());
        let session = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);
        engine
            .set_item(session, LEAF, string_value("durable"), EditFlags::DEFAULT)
            .unwrap();
        engine.commit(session).unwrap();
        engine.shutdown();
    }
    let engine = engine(tmp.path());
    let session = engine.session_start(UserCredentials::new("bob"), Datastore::Startup);
    assert_eq!(
        engine.get_item(session, LEAF).unwrap().data,
        ValueData::String("durable".into())
    );
}

#[test]
fn sessions_track_their_datastore_independently() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);

    engine
        .set_item(session, LEAF, string_value("startup-only"), EditFlags::DEFAULT)
        .unwrap();
    engine.commit(session).unwrap();

    engine
        .switch_datastore(session, Datastore::Candidate)
        .unwrap();
    // Candidate derives from running, which holds nothing for this module.
    assert!(engine.get_item(session, LEAF).is_err());

    engine
        .switch_datastore(session, Datastore::Startup)
        .unwrap();
    assert!(engine.get_item(session, LEAF).is_ok());
}

#[test]
fn move_reorders_user_ordered_list_across_commit() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);

    for key in ["a", "b", "c"] {
        engine
            .set_item(
                session,
                &format!("/example-module:container/list[key1='{key}'][key2='k']/leaf"),
                string_value("v"),
                EditFlags::DEFAULT,
            )
            .unwrap();
    }
    engine
        .move_item(
            session,
            "/example-module:container/list[key1='c'][key2='k']",
            constor::data::MovePosition::First,
            None,
        )
        .unwrap();
    engine.commit(session).unwrap();

    let reader = engine.session_start(UserCredentials::new("bob"), Datastore::Startup);
    let values = engine
        .get_items(reader, "/example-module:container/list")
        .unwrap();
    let first = &values[0];
    assert!(first.xpath.contains("key1='c'"), "got {}", first.xpath);
}

#[test]
fn get_unknown_module_is_unknown_model() {
    let tmp = TempDir::new().unwrap();
    let engine = engine(tmp.path());
    let session = engine.session_start(UserCredentials::new("alice"), Datastore::Startup);
    let err = engine.get_item(session, "/ghost-module:anything").unwrap_err();
    assert!(matches!(err, EngineError::UnknownModel(_)));
    // The failure is recorded as the session's last error.
    let last = engine.last_error(session).unwrap().unwrap();
    assert!(last.message.contains("ghost-module"));
}
