pub mod bus;
pub mod config;
pub mod coordinator;
pub mod stats;
pub mod status;

pub use bus::{SaveBroadcast, SaveBus, SaveEvent};
pub use config::{AutosaveConfig, AutosaveConfigPatch};
pub use coordinator::{AutosaveCoordinator, SaveOptions, backoff_delay};
pub use stats::AutosaveStatistics;
pub use status::{
    CoordinatorStatus, DataProvider, RunState, SaveStatus, StatusCallback, StatusEvent,
};
