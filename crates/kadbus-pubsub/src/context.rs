//! Request-scoped state of an inbound callback

use dashmap::DashMap;
use kadbus_protocol::{CallbackMessage, Contact, NodeId};
use std::sync::Arc;
use uuid::Uuid;

/// What a subscription callback knows about the delivery it serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackContext {
    pub id: Uuid,
    /// Node the callback runs on
    pub node: NodeId,
    /// Peer that delivered the message
    pub from: Contact,
    pub topic: String,
    pub correlation: Option<String>,
}

impl CallbackContext {
    pub fn new(node: NodeId, from: Contact, message: &CallbackMessage) -> Self {
        CallbackContext {
            id: Uuid::new_v4(),
            node,
            from,
            topic: message.topic.clone(),
            correlation: message.message.correlation_id().map(str::to_string),
        }
    }
}

/// Contexts of callbacks currently running
#[derive(Debug, Default, Clone)]
pub struct ActiveContexts {
    inner: Arc<DashMap<Uuid, CallbackContext>>,
}

impl ActiveContexts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `context` until the returned guard is dropped
    pub fn enter(&self, context: CallbackContext) -> ContextGuard {
        self.inner.insert(context.id, context.clone());
        ContextGuard {
            contexts: self.clone(),
            context,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.inner.contains_key(id)
    }
}

/// Removes its context from [`ActiveContexts`] on drop
#[derive(Debug)]
pub struct ContextGuard {
    contexts: ActiveContexts,
    context: CallbackContext,
}

impl ContextGuard {
    pub fn context(&self) -> &CallbackContext {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.contexts.inner.remove(&self.context.id);
    }
}
