// ABOUTME: Configuration and environment variable management for Kernel
// ABOUTME: Exposes variable name constants and the validated KernelConfig

pub mod constants;
pub mod settings;

pub use settings::{ConfigError, KernelConfig};
