//! Callback pipeline run for every inbound message

use async_trait::async_trait;
use kadbus_protocol::{CallbackMessage, Contact};
use kadbus_runtime::{CacheKey, Outcome, Processor};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::CALLBACK_NAMESPACE;
use crate::context::{CallbackContext, ContextGuard};
use crate::error::PubSubError;
use crate::peer::Peer;
use crate::waiters::SyncResponse;

pub struct CallbackArgs {
    pub peer: Arc<Peer>,
    pub from: Contact,
    pub message: CallbackMessage,
    /// Released when the arguments are dropped, whatever the outcome
    pub context: Option<ContextGuard>,
}

impl CallbackArgs {
    pub fn new(peer: Arc<Peer>, from: Contact, message: CallbackMessage) -> Self {
        CallbackArgs {
            peer,
            from,
            message,
            context: None,
        }
    }
}

pub struct BuildContext;

#[async_trait]
impl Processor<CallbackArgs> for BuildContext {
    fn name(&self) -> &str {
        "build-context"
    }

    async fn process(&self, args: &mut CallbackArgs) -> Outcome {
        let context = CallbackContext::new(args.peer.id(), args.from.clone(), &args.message);
        args.context = Some(args.peer.contexts().enter(context));
        Outcome::Continue
    }
}

/// Keep the inbound message when the subscription asks for caching
pub struct CacheCallback;

#[async_trait]
impl Processor<CallbackArgs> for CacheCallback {
    fn name(&self) -> &str {
        "cache-callback"
    }

    async fn process(&self, args: &mut CallbackArgs) -> Outcome {
        let subscription = match args.peer.subscription(&args.message.topic) {
            Some(subscription) if subscription.caching.enabled => subscription,
            _ => return Outcome::Continue,
        };

        let message = &args.message.message;
        let ttl = Duration::from_secs(subscription.caching.ttl_secs);
        let key = CacheKey::new(CALLBACK_NAMESPACE, args.peer.id().to_hex(), &message.key);
        let cache = args.peer.cache();

        if let Some(correlation) = subscription.caching.extract(message) {
            cache.insert(key.clone().with_correlation(correlation), message.clone(), ttl);
        }
        cache.insert(key, message.clone(), ttl);
        Outcome::Continue
    }
}

/// Hand correlated responses to a waiting synchronous publish
pub struct CompleteResponse;

#[async_trait]
impl Processor<CallbackArgs> for CompleteResponse {
    fn name(&self) -> &str {
        "complete-response"
    }

    async fn process(&self, args: &mut CallbackArgs) -> Outcome {
        let message = &args.message.message;
        if args
            .peer
            .complete_response(message, SyncResponse::Message(message.clone()))
        {
            debug!(key = %message.key, correlation = ?message.correlation_id(), "response delivered to waiter");
        }
        Outcome::Continue
    }
}

pub struct InvokeCallback;

#[async_trait]
impl Processor<CallbackArgs> for InvokeCallback {
    fn name(&self) -> &str {
        "invoke-callback"
    }

    async fn process(&self, args: &mut CallbackArgs) -> Outcome {
        let name = &args.message.callback;
        let callback = match args.peer.callback(name) {
            Some(callback) => callback,
            None => return Outcome::Fail(PubSubError::UnknownCallback(name.clone()).into()),
        };
        let guard = match args.context.as_ref() {
            Some(guard) => guard,
            None => return Outcome::Fail(anyhow::anyhow!("callback context missing")),
        };

        match callback.on_message(guard.context(), &args.message.message).await {
            Ok(()) => Outcome::Continue,
            Err(e) => Outcome::Fail(e.context(format!("callback {} on {}", name, args.message.topic))),
        }
    }
}

pub struct ReleaseContext;

#[async_trait]
impl Processor<CallbackArgs> for ReleaseContext {
    fn name(&self) -> &str {
        "release-context"
    }

    async fn process(&self, args: &mut CallbackArgs) -> Outcome {
        args.context.take();
        Outcome::Continue
    }
}
