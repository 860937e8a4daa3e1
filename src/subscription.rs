//! Subscriber bookkeeping: the in-memory registry keyed by
//! (module, kind, xpath, priority), the diff-matching predicate that decides
//! which subscribers see a change, and the delivery contract commits and the
//! operational-data broker speak through.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::data::diff::{DiffEntry, DiffKind};
use crate::data::tree::DataTree;
use crate::error::EngineError;
use crate::schema::model::{SchemaModule, SchemaNodeId};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionKind {
    ModuleChange,
    SubtreeChange,
    Rpc,
    Action,
    EventNotification,
    OperationalData,
    ModuleInstall,
    FeatureEnable,
}

/// Which commit events a change subscriber receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventFilter {
    Verify,
    Notify,
    Both,
}

impl EventFilter {
    pub fn wants_verify(&self) -> bool {
        matches!(self, EventFilter::Verify | EventFilter::Both)
    }

    pub fn wants_notify(&self) -> bool {
        matches!(self, EventFilter::Notify | EventFilter::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryAddress {
    pub address: String,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub module: String,
    pub xpath: Option<String>,
    pub kind: SubscriptionKind,
    pub delivery: DeliveryAddress,
    pub priority: u32,
    pub event_filter: EventFilter,
    /// Subscribing with this flag enables the module in running.
    pub enables_running: bool,
}

/// In-memory subscriber index. Queries take the read lock.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    inner: RwLock<Vec<Arc<Subscription>>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscription: Subscription) -> Arc<Subscription> {
        let subscription = Arc::new(subscription);
        self.inner.write().push(subscription.clone());
        debug!(
            "event=subscribed module={} kind={:?} dst={} dst_id={}",
            subscription.module,
            subscription.kind,
            subscription.delivery.address,
            subscription.delivery.id
        );
        subscription
    }

    pub fn unsubscribe(
        &self,
        module: &str,
        kind: SubscriptionKind,
        delivery: &DeliveryAddress,
    ) -> Result<(), EngineError> {
        let mut subs = self.inner.write();
        let before = subs.len();
        subs.retain(|sub| {
            !(sub.module == module && sub.kind == kind && sub.delivery == *delivery)
        });
        if subs.len() == before {
            return Err(EngineError::NotFound(format!(
                "subscription of {module} for {}",
                delivery.address
            )));
        }
        Ok(())
    }

    pub fn all(&self) -> Vec<Arc<Subscription>> {
        self.inner.read().clone()
    }

    pub fn for_module(&self, module: &str, kinds: &[SubscriptionKind]) -> Vec<Arc<Subscription>> {
        self.inner
            .read()
            .iter()
            .filter(|sub| sub.module == module && kinds.contains(&sub.kind))
            .cloned()
            .collect()
    }

    /// Change subscriptions of one module, descending by priority. The sort
    /// is stable, so ties keep registration order within one commit.
    pub fn change_subscriptions(&self, module: &str) -> Vec<Arc<Subscription>> {
        let mut subs = self.for_module(
            module,
            &[
                SubscriptionKind::ModuleChange,
                SubscriptionKind::SubtreeChange,
            ],
        );
        subs.sort_by(|a, b| b.priority.cmp(&a.priority));
        subs
    }

    pub fn operational_subscriptions(&self, module: &str) -> Vec<Arc<Subscription>> {
        self.for_module(module, &[SubscriptionKind::OperationalData])
    }
}

/// The subscription-matching predicate over one diff entry. `sub_node` is
/// the schema node the subscription's xpath denotes, or `None` for a
/// whole-module subscription.
pub fn match_subscription(
    schema: &SchemaModule,
    sub_node: Option<SchemaNodeId>,
    entry: &DiffEntry,
    old: &DataTree,
    new: &DataTree,
) -> bool {
    let Some(sub_schema) = sub_node else {
        return true;
    };
    // The subscribed node is the changed node or one of its ancestors.
    if schema.is_ancestor(sub_schema, entry.schema) {
        return true;
    }
    // The changed node is above the subscription: only a created or deleted
    // subtree can touch the subscribed node; walk it to find out.
    if schema.is_ancestor(entry.schema, sub_schema) {
        let (tree, root) = match entry.kind {
            DiffKind::Created => (new, entry.new_node),
            DiffKind::Deleted => (old, entry.old_node),
            _ => return false,
        };
        if let Some(root) = root {
            return tree
                .preorder(Some(root))
                .iter()
                .any(|id| tree.node(*id).schema == sub_schema);
        }
    }
    false
}

/// Delivery contract towards subscribers. A commit blocks inside `verify`
/// for at most the verify timeout; `notify` is fire-and-forget and failures
/// must not unwind a persisted commit.
pub trait SubscriberTransport: Send + Sync {
    /// Deliver a VERIFY event and wait for the verdict. Any error vetoes the
    /// commit; no answer within `timeout` is a timeout error.
    fn verify(
        &self,
        subscription: &Subscription,
        commit_id: u32,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    /// Deliver a NOTIFY event. Never blocks the commit on failure.
    fn notify(&self, subscription: &Subscription, commit_id: u32);

    /// Ask an operational-data provider for the subtree it serves.
    fn request_operational_data(
        &self,
        subscription: &Subscription,
        request_id: u64,
        xpath: &str,
    ) -> Result<(), EngineError>;

    /// Deliver an RPC or action call to its subscriber and wait for the
    /// output values.
    fn rpc(
        &self,
        subscription: &Subscription,
        xpath: &str,
        input: &[Value],
    ) -> Result<Vec<Value>, EngineError> {
        let _ = (xpath, input);
        Err(EngineError::Unsupported(format!(
            "no rpc delivery towards {}",
            subscription.delivery.address
        )))
    }

    /// Deliver an event notification with validated arguments.
    fn event_notification(
        &self,
        subscription: &Subscription,
        xpath: &str,
        values: &[Value],
    ) -> Result<(), EngineError> {
        let _ = (subscription, xpath, values);
        Ok(())
    }

    /// Module install / uninstall announcement.
    fn module_install(&self, subscription: &Subscription, module: &str, installed: bool) {
        let _ = (subscription, module, installed);
    }

    /// Feature toggle announcement.
    fn feature_enable(&self, subscription: &Subscription, module: &str, feature: &str, enabled: bool) {
        let _ = (subscription, module, feature, enabled);
    }
}

/// Transport that acknowledges everything and delivers nowhere; the default
/// for engines without subscribers.
#[derive(Debug, Default)]
pub struct NoopTransport;

impl SubscriberTransport for NoopTransport {
    fn verify(
        &self,
        subscription: &Subscription,
        commit_id: u32,
        _timeout: Duration,
    ) -> Result<(), EngineError> {
        debug!(
            "event=verify_noop dst={} commit_id={commit_id}",
            subscription.delivery.address
        );
        Ok(())
    }

    fn notify(&self, subscription: &Subscription, commit_id: u32) {
        debug!(
            "event=notify_noop dst={} commit_id={commit_id}",
            subscription.delivery.address
        );
    }

    fn request_operational_data(
        &self,
        subscription: &Subscription,
        request_id: u64,
        xpath: &str,
    ) -> Result<(), EngineError> {
        debug!(
            "event=provider_request_noop dst={} request_id={request_id} xpath={xpath}",
            subscription.delivery.address
        );
        Ok(())
    }
}
