//! Ordered processor chains
//!
//! A [`Pipeline`] runs its processors in declaration order against one
//! mutable argument bundle. A processor either lets the chain continue,
//! aborts it as a normal outcome, or fails it with an error.

use async_trait::async_trait;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;

use crate::error::{Result, RuntimeError};

/// What a processor tells the pipeline
#[derive(Debug)]
pub enum Outcome {
    Continue,
    /// Stop the chain; not an error
    Abort(String),
    /// Stop the chain with an error
    Fail(anyhow::Error),
}

impl Outcome {
    pub fn abort(reason: impl Into<String>) -> Self {
        Outcome::Abort(reason.into())
    }
}

/// How a pipeline run ended
#[derive(Debug)]
pub enum PipelineRun {
    Completed,
    Aborted { processor: String, reason: String },
    Failed { processor: String, error: anyhow::Error },
}

impl PipelineRun {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineRun::Completed)
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, PipelineRun::Aborted { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PipelineRun::Failed { .. })
    }
}

/// One step of a pipeline
#[async_trait]
pub trait Processor<A: Send + 'static>: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, args: &mut A) -> Outcome;
}

/// Named ordered list of processors over arguments `A`
pub struct Pipeline<A: Send + 'static> {
    name: String,
    processors: Vec<Arc<dyn Processor<A>>>,
}

impl<A: Send + 'static> Pipeline<A> {
    pub fn new(name: impl Into<String>) -> Self {
        Pipeline {
            name: name.into(),
            processors: Vec::new(),
        }
    }

    /// Append a processor
    pub fn with(mut self, processor: impl Processor<A> + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    pub fn push(&mut self, processor: Arc<dyn Processor<A>>) {
        self.processors.push(processor);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn processor_names(&self) -> Vec<&str> {
        self.processors.iter().map(|p| p.name()).collect()
    }

    /// Run every processor in order until one aborts or fails
    pub async fn invoke(&self, args: &mut A) -> PipelineRun {
        for processor in &self.processors {
            trace!(pipeline = %self.name, processor = processor.name(), "processing");
            match processor.process(args).await {
                Outcome::Continue => {}
                Outcome::Abort(reason) => {
                    return PipelineRun::Aborted {
                        processor: processor.name().to_string(),
                        reason,
                    }
                }
                Outcome::Fail(error) => {
                    return PipelineRun::Failed {
                        processor: processor.name().to_string(),
                        error,
                    }
                }
            }
        }
        PipelineRun::Completed
    }
}

/// A pipeline invoked with type-erased arguments
#[async_trait]
pub trait ErasedPipeline: Send + Sync {
    fn name(&self) -> &str;

    fn args_type(&self) -> &'static str;

    async fn invoke_erased(&self, args: Box<dyn Any + Send>) -> Result<PipelineRun>;
}

#[async_trait]
impl<A: Send + 'static> ErasedPipeline for Pipeline<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn args_type(&self) -> &'static str {
        type_name::<A>()
    }

    async fn invoke_erased(&self, args: Box<dyn Any + Send>) -> Result<PipelineRun> {
        let mut args = args
            .downcast::<A>()
            .map_err(|_| RuntimeError::ArgumentMismatch {
                pipeline: self.name.clone(),
                expected: type_name::<A>(),
            })?;
        Ok(self.invoke(&mut args).await)
    }
}

/// Pipelines by name, fixed once built
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<String, Arc<dyn ErasedPipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Send + 'static>(&mut self, pipeline: Pipeline<A>) -> Result<()> {
        let name = pipeline.name().to_string();
        if self.pipelines.contains_key(&name) {
            return Err(RuntimeError::DuplicatePipeline(name));
        }
        self.pipelines.insert(name, Arc::new(pipeline));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ErasedPipeline>> {
        self.pipelines
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownPipeline(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
