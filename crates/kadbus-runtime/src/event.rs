//! Type-erased units of work

use std::any::{type_name, Any};
use std::fmt;
use tokio::time::Instant;

/// A pipeline invocation waiting in a queue
///
/// Arguments are boxed as `Any`; the target pipeline downcasts them back to
/// its own argument type.
pub struct Event {
    pipeline: String,
    args: Box<dyn Any + Send>,
    args_type: &'static str,
    enqueued_at: Instant,
}

impl Event {
    pub fn new<A: Send + 'static>(pipeline: impl Into<String>, args: A) -> Self {
        Event {
            pipeline: pipeline.into(),
            args: Box::new(args),
            args_type: type_name::<A>(),
            enqueued_at: Instant::now(),
        }
    }

    /// Name of the pipeline that runs this event
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    pub fn args_type(&self) -> &'static str {
        self.args_type
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn is<A: 'static>(&self) -> bool {
        self.args.is::<A>()
    }

    /// Borrow the arguments as `A`
    pub fn args<A: 'static>(&self) -> Option<&A> {
        self.args.downcast_ref::<A>()
    }

    /// Recover the arguments, or the event unchanged on a type mismatch
    pub fn into_args<A: 'static>(self) -> std::result::Result<A, Self> {
        let Event {
            pipeline,
            args,
            args_type,
            enqueued_at,
        } = self;

        args.downcast::<A>()
            .map(|args| *args)
            .map_err(|args| Event {
                pipeline,
                args,
                args_type,
                enqueued_at,
            })
    }

    pub(crate) fn into_parts(self) -> (String, Box<dyn Any + Send>) {
        (self.pipeline, self.args)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("pipeline", &self.pipeline)
            .field("args", &self.args_type)
            .finish()
    }
}
