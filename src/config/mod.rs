//! Configuration Management Module
//!
//! Persistent settings and secure password storage via the system keychain.

pub mod keychain;
pub mod storage;

pub use keychain::{Keychain, KeychainError};
pub use storage::{
    config_dir, settings_file, ConnectionDefaults, Settings, SettingsStorage, StorageError,
    SETTINGS_VERSION,
};
