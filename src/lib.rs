//! A DAG-of-actors runtime for streaming, LLM-centric pipelines: nodes are
//! actor bodies running on their own OS thread, wired together by
//! single-writer/multi-reader byte pipes, with an append-only dependency
//! graph that the scheduler replans as it grows.

pub mod config;
pub mod dag;
pub mod dagops;
pub mod env;
pub mod errors;
pub mod flow;
pub mod kv;
pub mod node;
pub mod notify;
pub mod pipe;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod seqno;
pub mod value_node;
pub mod wasm_bridge;

pub use config::ExecutorOptions;
pub use dag::Dag;
pub use dagops::DagOpsHandle;
pub use env::Environment;
pub use errors::{ExecutionError, Result};
pub use node::{ActorFn, Dependency, Node};
pub use registry::{InMemoryRegistry, NodeDescriptor, NodeRegistry};
pub use runtime::NodeRuntime;
pub use scheduler::{run, Scheduler};
pub use wasm_bridge::{InMemoryModuleRegistry, ModuleRegistry, WasmEntryResult};

#[cfg(test)]
mod tests;
