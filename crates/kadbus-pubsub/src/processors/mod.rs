//! Processors of the subscribe, publish and callback pipelines

mod callback;
mod publish;
mod subscribe;

pub use callback::{BuildContext, CacheCallback, CallbackArgs, CompleteResponse, InvokeCallback, ReleaseContext};
pub use publish::{
    DetectRequestResponse, FindSubscriptions, PublishArgs, PublishMessageProcessor, RepublishPolicy,
};
pub use subscribe::{StoreSubscription, SubscribeArgs};

/// Cache namespace of outbound requests awaiting a response
pub const REQUEST_NAMESPACE: &str = "request";

/// Cache namespace of inbound callback messages
pub const CALLBACK_NAMESPACE: &str = "callback";
