//! Vault Module
//!
//! Connection secrets kept in the OS-native keychain.

pub mod credentials;
pub mod storage;

pub use credentials::KeyringCredentialProvider;
pub use storage::VaultStorage;
