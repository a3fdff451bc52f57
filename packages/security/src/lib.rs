// ABOUTME: Security and encryption functionality for Kernel
// ABOUTME: Provides encryption of secret values stored alongside agents

pub mod encryption;

pub use encryption::{secret_hint, EncryptionError, SecretCipher};
