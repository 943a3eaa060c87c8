//! # quay-engine
//!
//! The deployment orchestration engine: per-job state machine, source
//! materialization, the fix pipeline, build execution, publishing, and the
//! event bus that viewers subscribe to.
//!
//! Jobs run fire-and-forget under a supervisor that guarantees exactly one
//! terminal status event per job. All shared state lives in injectable,
//! per-instance stores, so multiple engines can run isolated in one process.

pub mod build;
pub mod bus;
pub mod coordinator;
pub mod fetch;
pub mod fixes;
pub mod publish;
pub mod source;
pub mod store;

pub use bus::{EventBus, Subscription};
pub use coordinator::Coordinator;
pub use fetch::{Fetcher, HttpFetcher, StubFetcher};
pub use fixes::{ExecutedFixSet, Fix, FixContext, FixPipeline};
pub use publish::{LocalPublisher, Publisher};
pub use source::Materializer;
pub use store::{JobStore, MemoryJobStore};
