//! Periodic agent invocation
//!
//! One loop ticks at the configured frequency. Every agent whose interval
//! has elapsed is invoked in a task of its own; the tick never waits for it.
//! A failing or panicking invocation is logged and the agent stays scheduled.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AgentSpec, ScheduleSettings};
use crate::error::{Result, RuntimeError};

/// Maintenance task invoked by the scheduler
#[async_trait]
pub trait Agent: Send + Sync {
    /// Methods accepted by [`Agent::invoke`]
    fn methods(&self) -> &[&'static str];

    async fn invoke(&self, method: &str, params: &BTreeMap<String, String>) -> anyhow::Result<()>;
}

/// Agents by implementation name
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any previous one with the same name
    pub fn register(&mut self, name: impl Into<String>, agent: Arc<dyn Agent>) {
        self.agents.insert(name.into(), agent);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

struct ScheduledAgent {
    spec: AgentSpec,
    agent: Arc<dyn Agent>,
    last_run: Option<Instant>,
    running: Arc<AtomicBool>,
}

impl ScheduledAgent {
    fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            Some(last) => now.saturating_duration_since(last) >= self.spec.interval(),
            None => true,
        }
    }
}

pub struct Scheduler {
    frequency: Duration,
    agents: Vec<ScheduledAgent>,
    token: CancellationToken,
}

impl Scheduler {
    /// Resolve every configured agent against the registry
    pub fn new(
        settings: &ScheduleSettings,
        registry: &AgentRegistry,
        token: CancellationToken,
    ) -> Result<Self> {
        if settings.frequency_ms == 0 {
            return Err(RuntimeError::InvalidSchedule(
                "frequency must be greater than zero".to_string(),
            ));
        }

        let mut agents = Vec::with_capacity(settings.agents.len());
        for spec in &settings.agents {
            let agent = registry
                .get(&spec.implementation)
                .ok_or_else(|| RuntimeError::UnknownAgent(spec.implementation.clone()))?;
            if !agent.methods().contains(&spec.method.as_str()) {
                return Err(RuntimeError::UnknownMethod {
                    agent: spec.implementation.clone(),
                    method: spec.method.clone(),
                });
            }
            agents.push(ScheduledAgent {
                spec: spec.clone(),
                agent,
                last_run: None,
                running: Arc::new(AtomicBool::new(false)),
            });
        }

        Ok(Scheduler {
            frequency: settings.frequency(),
            agents,
            token,
        })
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Run the tick loop until the token is cancelled
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut ticker = interval(self.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(agents = self.agents.len(), frequency_ms = self.frequency.as_millis() as u64, "scheduler started");

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = ticker.tick() => self.tick(Instant::now()),
            }
        }
        info!("scheduler stopped");
    }

    fn tick(&mut self, now: Instant) {
        for scheduled in &mut self.agents {
            if !scheduled.is_due(now) {
                continue;
            }
            if scheduled.running.swap(true, Ordering::SeqCst) {
                debug!(
                    agent = %scheduled.spec.implementation,
                    method = %scheduled.spec.method,
                    "previous run still in progress"
                );
                continue;
            }
            scheduled.last_run = Some(now);
            invoke(scheduled, self.token.child_token());
        }
    }
}

/// Fire one invocation in its own task
fn invoke(scheduled: &ScheduledAgent, token: CancellationToken) {
    let agent = Arc::clone(&scheduled.agent);
    let running = Arc::clone(&scheduled.running);
    let spec = scheduled.spec.clone();

    tokio::spawn(async move {
        debug!(agent = %spec.implementation, method = %spec.method, "invoking agent");
        let call = AssertUnwindSafe(agent.invoke(&spec.method, &spec.params)).catch_unwind();

        tokio::select! {
            _ = token.cancelled() => {
                debug!(agent = %spec.implementation, method = %spec.method, "agent run cancelled");
            }
            result = call => match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(agent = %spec.implementation, method = %spec.method, error = ?e, "agent run failed");
                }
                Err(_) => {
                    error!(agent = %spec.implementation, method = %spec.method, "agent panicked");
                }
            },
        }
        running.store(false, Ordering::SeqCst);
    });
}
