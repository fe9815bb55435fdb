pub mod file_store;
pub mod sweeper;

pub use file_store::{FileStore, Pool, StorageError, StoredFile};
pub use sweeper::{SweepPolicy, sweep};
