//! Worker contexts: the host capability, the worker-side runtime loop and
//! the executors that do the actual work.

pub mod executor;
pub mod host;
pub mod runtime;

pub use executor::{IdentityRenderer, NodeRenderer, RenderExecutor, TaskExecutor, render_tree};
pub use host::{
    Inbound, ThreadWorkerHost, WorkerContext, WorkerEvent, WorkerEventKind, WorkerEventSink, WorkerHost,
};
