//! kadbus daemon
//!
//! Hosts one or more DHT nodes with publish/subscribe on an in-process
//! network, runs the event queues, and schedules DHT maintenance.

pub mod agents;
pub mod config;
pub mod context;

pub use config::Config;
pub use context::AppContext;
