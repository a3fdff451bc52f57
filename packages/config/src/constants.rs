// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Kernel

// Server Configuration
pub const KERNEL_API_HOST: &str = "KERNEL_API_HOST";
pub const KERNEL_API_PORT: &str = "KERNEL_API_PORT";
pub const PORT: &str = "PORT"; // Legacy

// CORS Configuration
pub const KERNEL_CORS_ORIGIN: &str = "KERNEL_CORS_ORIGIN";

// Persistence
pub const KERNEL_DATABASE_URL: &str = "KERNEL_DATABASE_URL";
pub const DATABASE_URL: &str = "DATABASE_URL"; // Legacy
pub const KERNEL_ARTIFACTS_DIR: &str = "KERNEL_ARTIFACTS_DIR";
pub const ARTIFACTS_DIR: &str = "ARTIFACTS_DIR"; // Legacy

// Secret Encryption
pub const KERNEL_SECRET_KEY: &str = "KERNEL_SECRET_KEY";
pub const SECRET_KEY: &str = "SECRET_KEY"; // Legacy

// Sandbox Configuration
pub const KERNEL_SANDBOX_IMAGE: &str = "KERNEL_SANDBOX_IMAGE";
pub const KERNEL_SANDBOX_OUTPUT_DIR: &str = "KERNEL_SANDBOX_OUTPUT_DIR";
pub const KERNEL_PLATFORM_ENV: &str = "KERNEL_PLATFORM_ENV";

// Run Engine
pub const KERNEL_FLUSH_MAX_LINES: &str = "KERNEL_FLUSH_MAX_LINES";
pub const KERNEL_FLUSH_INTERVAL_MS: &str = "KERNEL_FLUSH_INTERVAL_MS";
pub const KERNEL_SUBSCRIBER_QUEUE_CAPACITY: &str = "KERNEL_SUBSCRIBER_QUEUE_CAPACITY";
pub const KERNEL_RECONCILE_ON_STARTUP: &str = "KERNEL_RECONCILE_ON_STARTUP";

// SSE Stream Configuration
pub const KERNEL_SSE_MAX_CONNECTIONS_PER_IP: &str = "KERNEL_SSE_MAX_CONNECTIONS_PER_IP";
