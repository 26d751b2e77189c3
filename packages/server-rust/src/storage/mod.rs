//! Operation storage.
//!
//! [`OperationStore`] is the persistence contract the engine depends on.
//! [`MemoryOperationStore`] implements it on a concurrent map and optionally
//! seals sensitive fields through an [`Encrypter`].

pub mod encryption;
pub mod memory;
pub mod operations;

pub use encryption::{Cipher, CodecError, Encrypter, MODE_CFB, MODE_GCM};
pub use memory::MemoryOperationStore;
pub use operations::{OperationStore, StorageError};
