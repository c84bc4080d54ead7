//! Pipeline and queue wiring

use kadbus_runtime::{Pipeline, PipelineRegistry, PipelineSettings, QueueManager};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;
use crate::processors::{
    BuildContext, CacheCallback, CallbackArgs, CompleteResponse, DetectRequestResponse,
    FindSubscriptions, InvokeCallback, PublishArgs, PublishMessageProcessor, ReleaseContext,
    RepublishPolicy, StoreSubscription, SubscribeArgs,
};

pub const SUBSCRIBE: &str = "subscribe";
pub const PUBLISH: &str = "publish";
pub const CALLBACK: &str = "callback";

/// Holding queue of failed publishes
pub const REPUBLISH: &str = "republish";

/// Queues worked by their own pool
pub const WORKED_QUEUES: [&str; 3] = [SUBSCRIBE, PUBLISH, CALLBACK];

pub fn build_registry(settings: &PipelineSettings, policy: RepublishPolicy) -> Result<PipelineRegistry> {
    let mut registry = PipelineRegistry::new();

    registry.register(Pipeline::<SubscribeArgs>::new(SUBSCRIBE).with(StoreSubscription))?;
    registry.register(
        Pipeline::<PublishArgs>::new(PUBLISH)
            .with(FindSubscriptions)
            .with(DetectRequestResponse)
            .with(PublishMessageProcessor::new(policy, settings.max_attempts)),
    )?;
    registry.register(
        Pipeline::<CallbackArgs>::new(CALLBACK)
            .with(BuildContext)
            .with(CacheCallback)
            .with(CompleteResponse)
            .with(InvokeCallback)
            .with(ReleaseContext),
    )?;

    Ok(registry)
}

/// Build every pub/sub queue; workers start with [`QueueManager::start`]
pub fn build_queues(
    settings: &PipelineSettings,
    policy: RepublishPolicy,
    token: CancellationToken,
) -> Result<QueueManager> {
    let registry = Arc::new(build_registry(settings, policy)?);
    let mut manager = QueueManager::from_settings(settings, WORKED_QUEUES, registry, token)?;

    if settings.workers_for(REPUBLISH) != 0 && settings.queues.contains_key(REPUBLISH) {
        warn!("republish queue is drained by the scheduler; ignoring its workerthreads");
    }
    manager.add_queue(REPUBLISH, 0)?;
    Ok(manager)
}

/// Move up to `max` failed publishes back onto the publish queue
pub async fn drain_republish(queues: &QueueManager, max: usize) -> Result<usize> {
    let events = queues.queue(REPUBLISH)?.drain(max).await;
    let count = events.len();
    for event in events {
        queues.enqueue(PUBLISH, event)?;
    }
    if count > 0 {
        debug!(count, "re-raised failed publishes");
    }
    Ok(count)
}
