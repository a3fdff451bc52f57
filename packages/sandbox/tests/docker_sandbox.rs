// ABOUTME: Integration tests against a real Docker daemon
// ABOUTME: Each test returns early when Docker is not reachable

use kernel_sandbox::{DockerSandbox, OutputLine, SandboxClient, StreamType};
use std::collections::HashMap;
use tokio::sync::mpsc;

const TEST_IMAGE: &str = "python:3.11-slim";

async fn docker() -> Option<DockerSandbox> {
    let sandbox = DockerSandbox::new(TEST_IMAGE).ok()?;
    if sandbox.is_available().await {
        Some(sandbox)
    } else {
        eprintln!("Docker not available, skipping");
        None
    }
}

fn drain(mut rx: mpsc::UnboundedReceiver<OutputLine>) -> Vec<OutputLine> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}

#[tokio::test]
async fn test_run_code_streams_output_and_reads_artifacts() {
    let Some(docker) = docker().await else {
        return;
    };

    let env = HashMap::from([("GREETING".to_string(), "hi".to_string())]);
    let handle = docker.create(&env).await.unwrap();
    docker.make_dir(&handle, "/data").await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let code = r#"
import os, sys
print(os.environ["GREETING"])
print("warn", file=sys.stderr)
open("/data/out.txt", "w").write("saved")
"#;
    let outcome = docker.run_code(&handle, code, tx).await.unwrap();
    assert!(outcome.error.is_none());

    let lines = drain(rx);
    assert!(lines
        .iter()
        .any(|l| l.stream == StreamType::Stdout && l.text == "hi"));
    assert!(lines
        .iter()
        .any(|l| l.stream == StreamType::Stderr && l.text == "warn"));

    let files = docker.list_files(&handle, "/data").await.unwrap();
    assert!(files.iter().any(|f| f.name == "out.txt" && !f.is_dir));
    let content = docker.read_file(&handle, "/data/out.txt").await.unwrap();
    assert_eq!(content, b"saved");

    docker.destroy(&handle).await.unwrap();
}

#[tokio::test]
async fn test_user_exception_is_reported_not_raised() {
    let Some(docker) = docker().await else {
        return;
    };

    let handle = docker.create(&HashMap::new()).await.unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let outcome = docker
        .run_code(&handle, "raise ValueError('bad input')", tx)
        .await
        .unwrap();
    docker.destroy(&handle).await.unwrap();

    let error = outcome.error.expect("exception should be reported");
    assert_eq!(error.name, "ValueError");
    assert_eq!(error.message, "bad input");
}
