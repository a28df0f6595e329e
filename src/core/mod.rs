pub mod document;
pub mod error;
pub mod instance;

pub use document::{Document, validate_and_repair};
pub use error::{ErrorCallback, Result, Severity, StorageError};
pub use instance::InstanceId;
