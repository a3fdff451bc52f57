// ABOUTME: Docker implementation of the sandbox client for local isolated runs
// ABOUTME: Uses bollard to run one long-lived container per run and exec into it

use crate::client::{
    CodeOutcome, ExecutionError, LineSender, OutputLine, Result, SandboxClient, SandboxError,
    SandboxFile, SandboxHandle, StreamType,
};
use crate::output::{parse_traceback, LineAssembler};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, LogOutput,
        RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    Docker,
};
use futures::StreamExt;
use std::collections::{HashMap, VecDeque};
use std::io::Read;
use std::time::Duration;
use tracing::{debug, info, warn};

const LABEL_PREFIX: &str = "kernel.sandbox";
const SCRIPT_DIR: &str = "/tmp";
const SCRIPT_NAME: &str = "kernel_main.py";

/// Stderr lines kept per exec for traceback parsing
const STDERR_TAIL_LINES: usize = 500;

/// Result of one exec inside the container.
struct ExecOutput {
    exit_code: i64,
    stdout: Vec<String>,
    stderr_tail: Vec<String>,
}

/// Output kept from an exec after its lines have been forwarded.
///
/// Stdout is only retained for capture-only commands; streamed commands keep nothing but
/// the stderr tail needed for traceback parsing.
struct OutputCapture {
    keep_stdout: bool,
    stdout: Vec<String>,
    stderr_tail: VecDeque<String>,
}

impl OutputCapture {
    fn new(keep_stdout: bool) -> Self {
        Self {
            keep_stdout,
            stdout: Vec::new(),
            stderr_tail: VecDeque::new(),
        }
    }

    fn record(&mut self, line: &OutputLine) {
        match line.stream {
            StreamType::Stdout => {
                if self.keep_stdout {
                    self.stdout.push(line.text.clone());
                }
            }
            StreamType::Stderr => {
                if self.stderr_tail.len() == STDERR_TAIL_LINES {
                    self.stderr_tail.pop_front();
                }
                self.stderr_tail.push_back(line.text.clone());
            }
        }
    }

    fn into_output(self, exit_code: i64) -> ExecOutput {
        ExecOutput {
            exit_code,
            stdout: self.stdout,
            stderr_tail: self.stderr_tail.into(),
        }
    }
}

pub struct DockerSandbox {
    client: Docker,
    image: String,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerSandbox {
    pub fn new(image: impl Into<String>) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| SandboxError::Connection(e.to_string()))?;
        Ok(Self::with_client(client, image))
    }

    pub fn with_client(client: Docker, image: impl Into<String>) -> Self {
        Self {
            client,
            image: image.into(),
            pull_timeout: Duration::from_secs(600),
        }
    }

    pub async fn is_available(&self) -> bool {
        match self.client.ping().await {
            Ok(_) => true,
            Err(e) => {
                warn!("Docker not available: {}", e);
                false
            }
        }
    }

    fn container_config(&self, env: &HashMap<String, String>) -> Config<String> {
        let mut labels = HashMap::new();
        labels.insert(format!("{}.managed", LABEL_PREFIX), "true".to_string());

        let mut env: Vec<String> = env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.sort();

        Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env),
            labels: Some(labels),
            ..Default::default()
        }
    }

    async fn ensure_image(&self) -> Result<()> {
        match self.client.inspect_image(&self.image).await {
            Ok(_) => return Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(SandboxError::Image(e.to_string())),
        }

        info!("Pulling image: {} (timeout: {:?})", self.image, self.pull_timeout);
        let options = CreateImageOptions {
            from_image: self.image.clone(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pull = async {
            while let Some(result) = stream.next().await {
                let info = result.map_err(|e| SandboxError::Image(e.to_string()))?;
                if let Some(error) = info.error {
                    return Err(SandboxError::Image(format!(
                        "Failed to pull image {}: {}",
                        self.image, error
                    )));
                }
            }
            Ok(())
        };

        tokio::time::timeout(self.pull_timeout, pull)
            .await
            .map_err(|_| {
                SandboxError::Image(format!(
                    "Timeout pulling image {} after {:?}",
                    self.image, self.pull_timeout
                ))
            })?
    }

    /// Run a command, forwarding each completed line to `lines` when given.
    /// Without a sender the command's stdout is captured for the caller instead.
    async fn exec(
        &self,
        sandbox: &SandboxHandle,
        command: Vec<String>,
        lines: Option<&LineSender>,
    ) -> Result<ExecOutput> {
        debug!("Executing in sandbox {}: {:?}", sandbox.id, command);

        let exec_config = CreateExecOptions {
            cmd: Some(command),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .client
            .create_exec(&sandbox.id, exec_config)
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))?;

        let start_result = self
            .client
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))?;

        let mut assembler = LineAssembler::new();
        let mut capture = OutputCapture::new(lines.is_none());

        let mut deliver = |batch: Vec<OutputLine>| {
            for line in batch {
                capture.record(&line);
                if let Some(tx) = lines {
                    // Receiver gone means nobody is listening any more
                    let _ = tx.send(line);
                }
            }
        };

        match start_result {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                            deliver(assembler.push(StreamType::Stdout, &message))
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            deliver(assembler.push(StreamType::Stderr, &message))
                        }
                        Ok(_) => {}
                        Err(e) => return Err(SandboxError::Container(e.to_string())),
                    }
                }
                deliver(assembler.finish());
            }
            StartExecResults::Detached => {
                return Err(SandboxError::Container(
                    "Exec was detached unexpectedly".to_string(),
                ))
            }
        }

        let exec_inspect = self
            .client
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))?;

        Ok(capture.into_output(exec_inspect.exit_code.unwrap_or(0)))
    }

    async fn upload_script(&self, sandbox: &SandboxHandle, code: &str) -> Result<()> {
        let tar_data = script_archive(code).map_err(|e| SandboxError::Internal(e.to_string()))?;

        let options = UploadToContainerOptions {
            path: SCRIPT_DIR.to_string(),
            ..Default::default()
        };

        self.client
            .upload_to_container(&sandbox.id, Some(options), tar_data.into())
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))
    }
}

#[async_trait]
impl SandboxClient for DockerSandbox {
    async fn create(&self, env: &HashMap<String, String>) -> Result<SandboxHandle> {
        self.ensure_image().await?;

        let name = format!("kernel-sandbox-{}", uuid::Uuid::new_v4().simple());
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), self.container_config(env))
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))?;

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))?;

        info!("Started sandbox container {} ({})", name, container.id);
        Ok(SandboxHandle { id: container.id })
    }

    async fn install(
        &self,
        sandbox: &SandboxHandle,
        packages: &[String],
        lines: LineSender,
    ) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }

        let mut command = vec![
            "python3".to_string(),
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--disable-pip-version-check".to_string(),
        ];
        command.extend(packages.iter().cloned());

        let output = self.exec(sandbox, command, Some(&lines)).await?;
        if output.exit_code != 0 {
            return Err(SandboxError::Command(format!(
                "pip install exited with status {}",
                output.exit_code
            )));
        }
        Ok(())
    }

    async fn run_code(
        &self,
        sandbox: &SandboxHandle,
        code: &str,
        lines: LineSender,
    ) -> Result<CodeOutcome> {
        self.upload_script(sandbox, code).await?;

        let command = vec![
            "python3".to_string(),
            "-u".to_string(),
            format!("{}/{}", SCRIPT_DIR, SCRIPT_NAME),
        ];
        let output = self.exec(sandbox, command, Some(&lines)).await?;

        if output.exit_code == 0 {
            return Ok(CodeOutcome::default());
        }

        let error = parse_traceback(&output.stderr_tail).unwrap_or_else(|| ExecutionError {
            name: "ProcessExit".to_string(),
            message: format!("exited with status {}", output.exit_code),
            traceback: Vec::new(),
        });
        Ok(CodeOutcome { error: Some(error) })
    }

    async fn make_dir(&self, sandbox: &SandboxHandle, path: &str) -> Result<()> {
        let command = vec!["mkdir".to_string(), "-p".to_string(), path.to_string()];
        let output = self.exec(sandbox, command, None).await?;
        if output.exit_code != 0 {
            return Err(SandboxError::File(format!(
                "mkdir {} exited with status {}",
                path, output.exit_code
            )));
        }
        Ok(())
    }

    async fn list_files(&self, sandbox: &SandboxHandle, dir: &str) -> Result<Vec<SandboxFile>> {
        // -p marks directories with a trailing slash
        let command = vec!["ls".to_string(), "-1Ap".to_string(), dir.to_string()];
        let output = self.exec(sandbox, command, None).await?;
        if output.exit_code != 0 {
            return Err(SandboxError::File(format!(
                "Cannot list {}: {}",
                dir,
                output.stderr_tail.join(" ")
            )));
        }
        Ok(parse_listing(&output.stdout))
    }

    async fn read_file(&self, sandbox: &SandboxHandle, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self
            .client
            .download_from_container(&sandbox.id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| SandboxError::File(e.to_string()))?;
            data.extend_from_slice(&bytes);
        }

        first_file_in_archive(&data)
            .map_err(|e| SandboxError::File(format!("Cannot read {}: {}", path, e)))
    }

    async fn destroy(&self, sandbox: &SandboxHandle) -> Result<()> {
        info!("Removing sandbox container {}", sandbox.id);

        let options = RemoveContainerOptions {
            force: true,
            v: true, // Remove volumes
            ..Default::default()
        };

        self.client
            .remove_container(&sandbox.id, Some(options))
            .await
            .map_err(|e| SandboxError::Container(e.to_string()))
    }
}

fn parse_listing(stdout: &[String]) -> Vec<SandboxFile> {
    stdout
        .iter()
        .map(|line| line.trim_end())
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_suffix('/') {
            Some(dir) => SandboxFile {
                name: dir.to_string(),
                is_dir: true,
            },
            None => SandboxFile {
                name: line.to_string(),
                is_dir: false,
            },
        })
        .collect()
}

fn script_archive(code: &str) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Builder::new(Vec::new());

    let mut header = tar::Header::new_gnu();
    header.set_size(code.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    archive.append_data(&mut header, SCRIPT_NAME, code.as_bytes())?;

    archive.into_inner()
}

fn first_file_in_archive(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "archive holds no regular file",
    ))
}
