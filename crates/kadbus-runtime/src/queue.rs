//! Named event queues and their workers
//!
//! Every queue is an unbounded FIFO shared by its worker tasks. Each worker
//! pulls one event at a time and runs the event's pipeline in a task of its
//! own, so a panicking processor shows up as a join error and the worker
//! keeps going. A queue with zero workers only holds events until someone
//! drains them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineSettings;
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::pipeline::{PipelineRegistry, PipelineRun};

/// Per-queue counters
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    processed: AtomicU64,
    aborted: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    /// Runs that completed every processor
    pub processed: u64,
    pub aborted: u64,
    pub failed: u64,
    pub panicked: u64,
}

impl QueueStatsSnapshot {
    /// Events that left the queue through a worker
    pub fn finished(&self) -> u64 {
        self.processed + self.aborted + self.failed + self.panicked
    }
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Unbounded FIFO of events
pub struct EventQueue {
    name: String,
    workers: usize,
    sender: mpsc::UnboundedSender<Event>,
    receiver: Mutex<mpsc::UnboundedReceiver<Event>>,
    len: AtomicUsize,
    stats: QueueStats,
}

impl EventQueue {
    pub fn new(name: impl Into<String>, workers: usize) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(EventQueue {
            name: name.into(),
            workers,
            sender,
            receiver: Mutex::new(receiver),
            len: AtomicUsize::new(0),
            stats: QueueStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Zero-worker queue drained explicitly
    pub fn is_holding(&self) -> bool {
        self.workers == 0
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn enqueue(&self, event: Event) -> Result<()> {
        self.len.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(event).is_err() {
            self.len.fetch_sub(1, Ordering::SeqCst);
            return Err(RuntimeError::QueueClosed(self.name.clone()));
        }
        QueueStats::bump(&self.stats.enqueued);
        Ok(())
    }

    /// Take up to `max` waiting events without blocking
    pub async fn drain(&self, max: usize) -> Vec<Event> {
        let mut receiver = self.receiver.lock().await;
        let mut events = Vec::new();
        while events.len() < max {
            match receiver.try_recv() {
                Ok(event) => {
                    self.len.fetch_sub(1, Ordering::SeqCst);
                    events.push(event);
                }
                Err(_) => break,
            }
        }
        events
    }

    /// Wait for the next event
    async fn next(&self) -> Option<Event> {
        let event = self.receiver.lock().await.recv().await;
        if event.is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        event
    }

    /// Run one event's pipeline in its own task and record the outcome
    async fn execute(&self, registry: &PipelineRegistry, event: Event) {
        let (name, args) = event.into_parts();
        let pipeline = match registry.get(&name) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                error!(queue = %self.name, error = %e, "dropping event");
                QueueStats::bump(&self.stats.failed);
                return;
            }
        };

        let task = tokio::spawn(async move { pipeline.invoke_erased(args).await });
        match task.await {
            Ok(Ok(PipelineRun::Completed)) => QueueStats::bump(&self.stats.processed),
            Ok(Ok(PipelineRun::Aborted { processor, reason })) => {
                debug!(queue = %self.name, pipeline = %name, processor = %processor, reason = %reason, "pipeline aborted");
                QueueStats::bump(&self.stats.aborted);
            }
            Ok(Ok(PipelineRun::Failed { processor, error })) => {
                error!(queue = %self.name, pipeline = %name, processor = %processor, error = ?error, "pipeline failed");
                QueueStats::bump(&self.stats.failed);
            }
            Ok(Err(e)) => {
                error!(queue = %self.name, pipeline = %name, error = %e, "pipeline rejected event");
                QueueStats::bump(&self.stats.failed);
            }
            Err(e) if e.is_panic() => {
                error!(queue = %self.name, pipeline = %name, error = %e, "processor panicked");
                QueueStats::bump(&self.stats.panicked);
            }
            Err(e) => {
                warn!(queue = %self.name, pipeline = %name, error = %e, "pipeline task cancelled");
                QueueStats::bump(&self.stats.failed);
            }
        }
    }
}

async fn run_worker(
    queue: Arc<EventQueue>,
    registry: Arc<PipelineRegistry>,
    token: CancellationToken,
    worker: usize,
) {
    debug!(queue = %queue.name, worker, "worker started");
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            event = queue.next() => match event {
                Some(event) => event,
                None => break,
            },
        };
        queue.execute(&registry, event).await;
    }
    debug!(queue = %queue.name, worker, "worker stopped");
}

/// Owns every named queue and its workers
pub struct QueueManager {
    queues: BTreeMap<String, Arc<EventQueue>>,
    registry: Arc<PipelineRegistry>,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueManager {
    pub fn new(registry: Arc<PipelineRegistry>, token: CancellationToken) -> Self {
        QueueManager {
            queues: BTreeMap::new(),
            registry,
            token,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Create the named queues with worker counts from `settings`
    pub fn from_settings<'a>(
        settings: &PipelineSettings,
        names: impl IntoIterator<Item = &'a str>,
        registry: Arc<PipelineRegistry>,
        token: CancellationToken,
    ) -> Result<Self> {
        let mut manager = Self::new(registry, token);
        for name in names {
            manager.add_queue(name, settings.workers_for(name))?;
        }
        Ok(manager)
    }

    pub fn add_queue(&mut self, name: &str, workers: usize) -> Result<Arc<EventQueue>> {
        if self.queues.contains_key(name) {
            return Err(RuntimeError::DuplicateQueue(name.to_string()));
        }
        let queue = EventQueue::new(name, workers);
        self.queues.insert(name.to_string(), Arc::clone(&queue));
        Ok(queue)
    }

    pub fn queue(&self, name: &str) -> Result<Arc<EventQueue>> {
        self.queues
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownQueue(name.to_string()))
    }

    pub fn enqueue(&self, queue: &str, event: Event) -> Result<()> {
        self.queue(queue)?.enqueue(event)
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.registry
    }

    pub fn queue_names(&self) -> Vec<&str> {
        self.queues.keys().map(String::as_str).collect()
    }

    pub fn stats(&self) -> BTreeMap<String, QueueStatsSnapshot> {
        self.queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.stats()))
            .collect()
    }

    /// Spawn the workers of every queue
    pub async fn start(&self) {
        let mut handles = self.handles.lock().await;
        for queue in self.queues.values() {
            for worker in 0..queue.workers() {
                handles.push(tokio::spawn(run_worker(
                    Arc::clone(queue),
                    Arc::clone(&self.registry),
                    self.token.clone(),
                    worker,
                )));
            }
            info!(queue = %queue.name(), workers = queue.workers(), "queue started");
        }
    }

    /// Signal every worker and wait for in-flight events to finish
    pub async fn shutdown(&self) {
        self.token.cancel();
        let handles: Vec<_> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker ended abnormally");
            }
        }
        info!("event queues stopped");
    }
}
