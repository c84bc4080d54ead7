//! Pending synchronous publishes keyed by correlation id

use dashmap::DashMap;
use kadbus_protocol::{DataResponse, PublishMessage};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{PubSubError, Result};

/// What completes a synchronous publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncResponse {
    /// Rows returned by a data request
    Data(DataResponse),
    /// A correlated message published back to the caller
    Message(PublishMessage),
}

#[derive(Debug, Default)]
pub struct ResponseWaiters {
    pending: DashMap<String, oneshot::Sender<SyncResponse>>,
}

/// Handle held by the caller of a synchronous publish
#[derive(Debug)]
pub struct ResponseHandle {
    correlation: String,
    receiver: oneshot::Receiver<SyncResponse>,
}

impl ResponseHandle {
    pub fn correlation(&self) -> &str {
        &self.correlation
    }
}

impl ResponseWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `correlation`; a previous waiter is replaced
    pub fn register(&self, correlation: impl Into<String>) -> ResponseHandle {
        let correlation = correlation.into();
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(correlation.clone(), sender);
        ResponseHandle {
            correlation,
            receiver,
        }
    }

    pub fn is_waiting(&self, correlation: &str) -> bool {
        self.pending.contains_key(correlation)
    }

    /// Hand `response` to the waiter; false when nobody was waiting
    pub fn complete(&self, correlation: &str, response: SyncResponse) -> bool {
        match self.pending.remove(correlation) {
            Some((_, sender)) => sender.send(response).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, correlation: &str) {
        self.pending.remove(correlation);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Wait for the response, dropping the waiter on timeout
    pub async fn wait(&self, handle: ResponseHandle, limit: Duration) -> Result<SyncResponse> {
        let ResponseHandle {
            correlation,
            receiver,
        } = handle;

        match timeout(limit, receiver).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                debug!(correlation = %correlation, "waiter replaced before completion");
                Err(PubSubError::Timeout(limit))
            }
            Err(_) => {
                self.cancel(&correlation);
                Err(PubSubError::Timeout(limit))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_wakes_waiter() {
        let waiters = ResponseWaiters::new();
        let handle = waiters.register("c-1");
        assert!(waiters.is_waiting("c-1"));

        let response = SyncResponse::Data(DataResponse::default());
        assert!(waiters.complete("c-1", response.clone()));
        assert!(!waiters.complete("c-1", response.clone()));

        let got = waiters.wait(handle, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, response);
        assert!(waiters.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_waiter() {
        let waiters = ResponseWaiters::new();
        let handle = waiters.register("c-2");

        let result = waiters.wait(handle, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(PubSubError::Timeout(_))));
        assert!(!waiters.is_waiting("c-2"));
    }
}
