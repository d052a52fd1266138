//! Relays chat-thread prompts to coding-agent backends with one active
//! execution per thread, ordered queueing, session resume and cancellation.

pub mod cli;
pub mod config;
pub mod execution;
pub mod notifier;
pub mod queue;
pub mod relay;
pub mod session;
pub mod store;
pub mod transport;
pub mod workspace;

pub use agent_relay_error::{ErrorType, RelayError};
pub use agent_relay_worker_registry::{WorkerRegistry, WorkerRegistryConfig};
pub use execution::{BackendKind, Execution, ExecutionCallbacks, ExecutionResult};
pub use relay::{Relay, RelaySettings, Submission};
