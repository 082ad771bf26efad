//! Cryptographic primitives: at-rest token encryption.

mod encryption;

pub use encryption::{EncryptionError, EncryptionManager};
