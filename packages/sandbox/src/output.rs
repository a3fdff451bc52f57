// ABOUTME: Turns raw exec output chunks into lines and recognizes Python tracebacks
// ABOUTME: Chunks may split lines or carry several at once; partial tails are held per stream

use crate::client::{ExecutionError, OutputLine, StreamType};

const TRACEBACK_HEADER: &str = "Traceback (most recent call last):";

/// Reassembles complete lines from arbitrarily split byte chunks.
#[derive(Debug, Default)]
pub struct LineAssembler {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed.
    pub fn push(&mut self, stream: StreamType, chunk: &[u8]) -> Vec<OutputLine> {
        let buffer = match stream {
            StreamType::Stdout => &mut self.stdout,
            StreamType::Stderr => &mut self.stderr,
        };
        buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = buffer.drain(..=pos).collect();
            lines.push(OutputLine {
                stream,
                text: decode_line(&raw[..raw.len() - 1]),
            });
        }
        lines
    }

    /// Emit whatever unterminated text remains, stdout first.
    pub fn finish(&mut self) -> Vec<OutputLine> {
        let mut lines = Vec::new();
        for (stream, buffer) in [
            (StreamType::Stdout, &mut self.stdout),
            (StreamType::Stderr, &mut self.stderr),
        ] {
            if !buffer.is_empty() {
                lines.push(OutputLine {
                    stream,
                    text: decode_line(buffer),
                });
                buffer.clear();
            }
        }
        lines
    }
}

/// A carriage return inside a line rewrites it on a terminal (progress bars), so only the
/// text after the last one survives. Lines never carry a `\r` onward.
fn decode_line(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end_matches('\r');
    match text.rsplit_once('\r') {
        Some((_, shown)) => shown.to_string(),
        None => text.to_string(),
    }
}

/// Extract the last Python traceback from collected stderr lines.
///
/// Returns `None` when stderr holds no traceback, e.g. a bare non-zero exit.
pub fn parse_traceback(stderr: &[String]) -> Option<ExecutionError> {
    let start = stderr.iter().rposition(|line| line.trim_end() == TRACEBACK_HEADER)?;
    let traceback: Vec<String> = stderr[start..].to_vec();

    let summary = traceback
        .iter()
        .skip(1)
        .rev()
        .find(|line| !line.trim().is_empty() && !line.starts_with(' '))?;

    let (name, message) = match summary.split_once(':') {
        Some((name, message)) => (name.trim().to_string(), message.trim().to_string()),
        None => (summary.trim().to_string(), String::new()),
    };

    Some(ExecutionError {
        name,
        message,
        traceback,
    })
}
