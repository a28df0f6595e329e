pub mod host;
pub mod local_store;
pub mod locks;
pub mod service;

pub use host::{DirectoryPicker, DirectoryReference, FsHost, PermissionState, StorageHost};
pub use local_store::{LocalStore, keys};
pub use locks::{InstanceWriteGuard, ResourceWriteGuard, WriteLockRegistry};
pub use service::{DOCUMENT_FILE, LastSaveEntry, SERVICE_NAME, StorageService};
