// ABOUTME: Sandbox capability used to run agent code in isolation
// ABOUTME: Exposes the client trait, the Docker-backed client and output line handling

pub mod client;
pub mod docker;
pub mod output;

pub use client::{
    CodeOutcome, ExecutionError, LineSender, OutputLine, Result, SandboxClient, SandboxError,
    SandboxFile, SandboxHandle, StreamType,
};
pub use docker::DockerSandbox;
pub use output::{parse_traceback, LineAssembler};
