#![allow(dead_code)]

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use constor::engine::{Engine, EngineBuilder};
use constor::error::EngineError;
use constor::schema::{SchemaModule, SchemaModuleBuilder};
use constor::session::SessionId;
use constor::subscription::{
    DeliveryAddress, EventFilter, SubscriberTransport, Subscription, SubscriptionKind,
};
use constor::timeouts::EngineTimeouts;
use constor::value::{LeafType, Value, ValueData};

/// The spec-scenario module: a container with a two-key user-ordered list
/// and a user-ordered leaf-list.
pub fn example_module() -> SchemaModule {
    let mut b = SchemaModuleBuilder::new("example-module").namespace("urn:example");
    let container = b.container(None, "container");
    let list = b.list(Some(container), "list", &["key1", "key2"], true);
    b.leaf(Some(list), "key1", LeafType::String, None);
    b.leaf(Some(list), "key2", LeafType::String, None);
    b.leaf(Some(list), "leaf", LeafType::String, None);
    b.leaf_list(Some(container), "numbers", LeafType::Uint32, true);
    b.build().unwrap()
}

/// The procedure-scenario module: a main container, an RPC with a defaulted
/// input leaf, a nested action and a notification.
pub fn test_module() -> SchemaModule {
    let mut b = SchemaModuleBuilder::new("test-module").namespace("urn:test");
    let main = b.container(None, "main");
    b.leaf(Some(main), "i8", LeafType::Int8, None);
    b.leaf(Some(main), "options", LeafType::String, Some("defaults"));

    let (_, input, _) = b.rpc("activate-software-image");
    b.leaf(Some(input), "image-name", LeafType::String, None);
    b.leaf(Some(input), "location", LeafType::String, Some("/"));

    let modules = b.container(None, "kernel-modules");
    let module = b.list(Some(modules), "kernel-module", &["name"], false);
    b.leaf(Some(module), "name", LeafType::String, None);
    let (_, action_input, _) = b.action(module, "status-change");
    b.leaf(Some(action_input), "direction", LeafType::String, None);

    let alarm = b.notification(None, "alarm");
    b.leaf(Some(alarm), "severity", LeafType::String, Some("minor"));
    b.build().unwrap()
}

/// A module carrying an operational subtree served by providers.
pub fn state_module() -> SchemaModule {
    let mut b = SchemaModuleBuilder::new("iface-module").namespace("urn:iface");
    let interfaces = b.container(None, "interfaces");
    let iface = b.list(Some(interfaces), "interface", &["name"], false);
    b.leaf(Some(iface), "name", LeafType::String, None);
    b.leaf(Some(iface), "mtu", LeafType::Uint32, None);
    let stats = b.container(None, "stats");
    let counter = b.list(Some(stats), "counter", &["name"], false);
    b.leaf(Some(counter), "name", LeafType::String, None);
    b.leaf(Some(counter), "value", LeafType::Uint64, None);
    b.state_subtree(stats);
    b.build().unwrap()
}

pub fn builder(root: &Path) -> EngineBuilder {
    Engine::builder(root).worker_count(2)
}

pub fn engine(root: &Path) -> Arc<Engine> {
    let engine = builder(root).build().unwrap();
    install_fixture_modules(&engine);
    engine
}

pub fn install_fixture_modules(engine: &Engine) {
    engine.install_module(example_module(), None).unwrap();
    engine.install_module(test_module(), None).unwrap();
    engine.install_module(state_module(), None).unwrap();
}

pub fn short_timeouts() -> EngineTimeouts {
    EngineTimeouts {
        operational_data: Duration::from_millis(200),
        ..EngineTimeouts::default()
    }
}

pub fn string_value(text: &str) -> Option<ValueData> {
    Some(ValueData::String(text.into()))
}

pub fn change_subscription(module: &str, address: &str, priority: u32) -> Subscription {
    Subscription {
        module: module.into(),
        xpath: None,
        kind: SubscriptionKind::ModuleChange,
        delivery: DeliveryAddress {
            address: address.into(),
            id: priority,
        },
        priority,
        event_filter: EventFilter::Both,
        enables_running: false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveredEvent {
    Verify { address: String, commit_id: u32 },
    Notify { address: String, commit_id: u32 },
    Provider { address: String, request_id: u64 },
}

/// Transport that records every delivery and can be told to veto specific
/// verifier addresses.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    pub events: Mutex<Vec<DeliveredEvent>>,
    pub vetoes: Mutex<HashSet<String>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn veto(&self, address: &str) {
        self.vetoes.lock().insert(address.to_string());
    }

    pub fn clear_vetoes(&self) {
        self.vetoes.lock().clear();
    }

    pub fn events(&self) -> Vec<DeliveredEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }
}

impl SubscriberTransport for RecordingTransport {
    fn verify(
        &self,
        subscription: &Subscription,
        commit_id: u32,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        self.events.lock().push(DeliveredEvent::Verify {
            address: subscription.delivery.address.clone(),
            commit_id,
        });
        if self.vetoes.lock().contains(&subscription.delivery.address) {
            return Err(EngineError::OperationFailed(format!(
                "{} refused the change",
                subscription.delivery.address
            )));
        }
        Ok(())
    }

    fn notify(&self, subscription: &Subscription, commit_id: u32) {
        self.events.lock().push(DeliveredEvent::Notify {
            address: subscription.delivery.address.clone(),
            commit_id,
        });
    }

    fn request_operational_data(
        &self,
        subscription: &Subscription,
        request_id: u64,
        _xpath: &str,
    ) -> Result<(), EngineError> {
        self.events.lock().push(DeliveredEvent::Provider {
            address: subscription.delivery.address.clone(),
            request_id,
        });
        Ok(())
    }
}

/// Transport for the operational-data path: answers provider requests from a
/// separate thread after a configurable delay, or not at all.
#[derive(Default)]
pub struct ProviderTransport {
    pub engine: Mutex<Option<std::sync::Weak<Engine>>>,
    pub session: Mutex<Option<SessionId>>,
    pub values: Mutex<Vec<Value>>,
    pub delay: Mutex<Duration>,
    pub silent: Mutex<bool>,
}

impl ProviderTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, engine: &Arc<Engine>, session: SessionId) {
        *self.engine.lock() = Some(Arc::downgrade(engine));
        *self.session.lock() = Some(session);
    }

    pub fn serve(&self, values: Vec<Value>, delay: Duration) {
        *self.values.lock() = values;
        *self.delay.lock() = delay;
        *self.silent.lock() = false;
    }

    pub fn go_silent(&self) {
        *self.silent.lock() = true;
    }
}

impl SubscriberTransport for ProviderTransport {
    fn verify(
        &self,
        _subscription: &Subscription,
        _commit_id: u32,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn notify(&self, _subscription: &Subscription, _commit_id: u32) {}

    fn request_operational_data(
        &self,
        _subscription: &Subscription,
        request_id: u64,
        _xpath: &str,
    ) -> Result<(), EngineError> {
        if *self.silent.lock() {
            return Ok(());
        }
        let engine = self.engine.lock().clone();
        let session = *self.session.lock();
        let values = self.values.lock().clone();
        let delay = *self.delay.lock();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            if let (Some(engine), Some(session)) = (engine.and_then(|weak| weak.upgrade()), session)
            {
                let _ = engine.provider_response(session, request_id, &values);
            }
        });
        Ok(())
    }
}
