//! Queue and scheduler settings

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-queue overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Worker count; zero makes a holding queue
    #[serde(default)]
    pub workerthreads: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Workers for queues without an override
    pub workerthreads: usize,

    /// Delivery attempts before a retried event is dropped
    pub max_attempts: u32,

    pub queues: BTreeMap<String, QueueSettings>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        PipelineSettings {
            workerthreads: 2,
            max_attempts: 5,
            queues: BTreeMap::new(),
        }
    }
}

impl PipelineSettings {
    /// Worker count for the named queue
    pub fn workers_for(&self, queue: &str) -> usize {
        self.queues
            .get(queue)
            .and_then(|q| q.workerthreads)
            .unwrap_or(self.workerthreads)
    }
}

/// A periodically invoked agent method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Registered agent name
    pub implementation: String,
    pub method: String,
    pub interval_secs: u64,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl AgentSpec {
    pub fn new(implementation: impl Into<String>, method: impl Into<String>, interval_secs: u64) -> Self {
        AgentSpec {
            implementation: implementation.into(),
            method: method.into(),
            interval_secs,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleSettings {
    /// Scheduler tick
    pub frequency_ms: u64,
    pub agents: Vec<AgentSpec>,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        ScheduleSettings {
            frequency_ms: 1_000,
            agents: Vec::new(),
        }
    }
}

impl ScheduleSettings {
    pub fn frequency(&self) -> Duration {
        Duration::from_millis(self.frequency_ms)
    }
}
