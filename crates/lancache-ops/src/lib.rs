//! Process-wide operation plumbing for the Lancache core.
//!
//! - [`events`]: the outbound event bus the API layer subscribes to
//! - [`registry`]: the catalogue of in-flight long-running operations,
//!   with cancellation, throttled progress and exactly-once completion
//! - [`state`]: atomic JSON persistence for positions, app state and
//!   operation progress, plus crash recovery
//! - [`secrets`]: the encrypted secret store

pub mod error;
pub mod events;
pub mod registry;
pub mod secrets;
pub mod state;

pub use error::{Error, Result};
pub use events::{Event, EventBus};
pub use registry::{OperationRegistry, OperationSnapshot, OperationType};
pub use state::{
    AppState, LogPosition, OperationState, OperationStateWriter, OperationStatus, PositionStore,
};
