pub mod crypto;
pub mod db;
pub mod entities;
pub mod storage;
pub mod writer;

pub use crypto::{SecretCipher, mask_key, validate_key_strength};
pub use storage::{SqlStorage, StorageError, StorageResult};
pub use writer::spawn_log_writer;
