//! Subscribe pipeline

use async_trait::async_trait;
use kadbus_dht::PutReport;
use kadbus_protocol::Subscription;
use kadbus_runtime::{Outcome, Processor};
use std::sync::Arc;
use tracing::info;

use crate::peer::Peer;

pub struct SubscribeArgs {
    pub peer: Arc<Peer>,
    pub subscription: Subscription,
    pub report: Option<PutReport>,
}

impl SubscribeArgs {
    pub fn new(peer: Arc<Peer>, subscription: Subscription) -> Self {
        SubscribeArgs {
            peer,
            subscription,
            report: None,
        }
    }
}

/// Put the subscription into the DHT under its topic
pub struct StoreSubscription;

#[async_trait]
impl Processor<SubscribeArgs> for StoreSubscription {
    fn name(&self) -> &str {
        "store-subscription"
    }

    async fn process(&self, args: &mut SubscribeArgs) -> Outcome {
        let topic = &args.subscription.topic;
        if args.peer.subscription(topic).is_none() {
            return Outcome::abort(format!("unsubscribed from {} before storing", topic));
        }

        let value = match args.subscription.encode() {
            Ok(value) => value,
            Err(e) => return Outcome::Fail(e.into()),
        };

        match args.peer.node().put(topic, value).await {
            Ok(report) => {
                info!(
                    node = %args.peer.id(),
                    topic = %topic,
                    replicas = report.replicas_ok,
                    "subscription stored"
                );
                args.report = Some(report);
                Outcome::Continue
            }
            Err(e) => Outcome::Fail(anyhow::Error::new(e).context(format!("storing subscription to {}", topic))),
        }
    }
}
