//! kadbus event runtime
//!
//! Named queues of type-erased events, each drained by a pool of tokio
//! workers that run the event's pipeline of processors. Also carries the
//! periodic agent scheduler and the expiring cache shared by the pub/sub
//! layer.

pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod pipeline;
pub mod queue;
pub mod scheduler;

pub use cache::{CacheKey, ExpiringCache};
pub use config::{AgentSpec, PipelineSettings, QueueSettings, ScheduleSettings};
pub use error::{Result, RuntimeError};
pub use event::Event;
pub use pipeline::{ErasedPipeline, Outcome, Pipeline, PipelineRegistry, PipelineRun, Processor};
pub use queue::{EventQueue, QueueManager, QueueStats, QueueStatsSnapshot};
pub use scheduler::{Agent, AgentRegistry, Scheduler};
