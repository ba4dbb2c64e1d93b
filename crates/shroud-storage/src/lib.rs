//! shroud-storage: the object-store interface the sync engine talks to
//!
//! One bucket, one flat namespace. Backends:
//! - [`OpendalStore`]: any S3-compatible endpoint through OpenDAL
//! - [`MemoryStore`]: in-process, for tests and dry runs

pub mod memory;
pub mod operator;
pub mod store;

pub use memory::{MemoryStore, StoreOp};
pub use operator::{build_from_core_config, build_operator, OpendalStore, StorageConfig};
pub use store::{BodyReader, Fields, ObjectStore, RemoteObject};
