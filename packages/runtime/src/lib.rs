// ABOUTME: Run execution engine for Kernel
// ABOUTME: Lifecycle state machine, live log broadcast, buffered persistence and zombie reconciliation

pub mod artifacts;
pub mod broadcast;
pub mod error;
pub mod flush;
pub mod lifecycle;
pub mod manager;
pub mod reconciler;
pub mod registry;

pub use artifacts::LocalArtifactStore;
pub use broadcast::{EventStream, LogBroadcast, LogSubscription, StreamEvent, LAGGED_LINE};
pub use error::{Result, RuntimeError};
pub use flush::{FlushPolicy, LogBuffer};
pub use lifecycle::RunRequest;
pub use manager::{EngineSettings, RunManager, MANUAL_TRIGGER};
pub use reconciler::{COMPLETED_LINE, INTERRUPTED_LINE, NOT_STARTED_LINE};
pub use registry::{LiveRun, RunRegistry};
