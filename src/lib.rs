//! Core library entrypoint for the constor configuration datastore engine:
//! schema-validated configuration trees across startup, running and
//! candidate datastores, sessioned edits with optimistic isolation, a
//! subscriber-mediated two-phase commit and an operational-data broker.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, warn(missing_docs))]

pub mod commit;
pub mod data;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod locks;
pub mod notifications;
pub mod oplog;
pub mod provider;
pub mod schema;
pub mod session;
pub mod store;
pub mod subscription;
pub mod telemetry;
pub mod timeouts;
pub mod validate;
pub mod value;
pub mod xpath;

pub use commit::{CommitContext, CommitContexts, ModuleSubscriptions};
pub use data::{
    apply_delete, apply_move, apply_set, Change, ChangeOp, DataTree, DiffEntry, DiffKind,
    EditFlags, MovePosition, NodeId,
};
pub use dispatch::{CircularBuffer, Dispatcher, Request, RequestEnvelope, Response};
pub use engine::{dump_working_tree, Engine, EngineBuilder};
pub use error::{EngineError, ErrorCode, SessionError};
pub use locks::{LockKey, LockSet};
pub use notifications::{NotificationStore, RetainedNotification};
pub use oplog::{Operation, ReplayReport, ReplayTarget};
pub use schema::{
    DependencyKind, ModuleDependency, ModuleDependencyIndex, ModuleEntry, ModuleRecord, NodeState,
    SchemaLoader, SchemaModule, SchemaModuleBuilder, SchemaNodeId, SchemaNodeKind, SchemaRegistry,
    StaticSchemaLoader,
};
pub use session::{DataInfo, Session, SessionId, SessionState, UserCredentials};
pub use store::{
    AccessControl, AllowAll, JsonSettingsStore, MemorySettingsStore, PersistedModule,
    PersistedSubscription, RepoLayout, SettingsStore,
};
pub use subscription::{
    DeliveryAddress, EventFilter, NoopTransport, SubscriberTransport, Subscription,
    SubscriptionKind, SubscriptionRegistry,
};
pub use telemetry::{MetricsRegistry, MetricsSnapshot, SharedMetrics};
pub use timeouts::EngineTimeouts;
pub use validate::{materialize_defaults, validate_procedure, validate_tree, ArgDirection, ProcedureKind};
pub use value::{Datastore, LeafType, Value, ValueData};
pub use xpath::{Predicate, Step, XPath};
