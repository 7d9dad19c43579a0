//! # helm-engine
//!
//! Session-processing concurrency core.
//!
//! - **Store**: one [`SessionContext`](helm_core::SessionContext) per conversation
//! - **Concurrency manager**: per-session lock with a FIFO waiter queue
//! - **Pipeline**: ordered stages with deadlines, cancellation and contract checks
//! - **Splitter**: turns one provider stream into several persisted messages
//! - **Circuit breaker / sub-tasks**: admission and lifecycle of `Task` invocations
//!
//! ## Crate Position
//!
//! Depends on: helm-core, helm-settings.
//! Depended on by: the `helm` binary.

#![deny(unsafe_code)]

pub mod circuit;
pub mod concurrency;
pub mod mock;
pub mod pipeline;
pub mod splitter;
pub mod stages;
pub mod store;
pub mod subtask;

pub use circuit::{CircuitBreakerConfig, CircuitState, SubagentCircuitBreaker};
pub use concurrency::{ConcurrencyManager, LockAcquisition, MessageDescriptor, SessionLease, WaitHandle};
pub use pipeline::{Collaborators, MessagePipeline, PipelineConfig, Stage, StageScope};
pub use splitter::{ActiveTaskStack, Segment, SplitterSinks, StreamingMessageSplitter};
pub use stages::{default_stages, ContextInjectionStage, FinalizationStage, StreamingStage};
pub use store::SessionContextStore;
pub use subtask::{SubtaskConfig, SubtaskCoordinator, TaskAdmission};
