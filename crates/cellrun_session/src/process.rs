//! Engine backend that spawns an external program for every cell.
//!
//! The program receives the cell text on stdin. Nothing carries over between cells.

use std::process::Stdio;

use cellrun_config::CommandConfig;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::Command;

use crate::error::{SessionError, SessionResult};
use crate::host::OutputItem;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    args: Vec<String>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn create_from_command_config(command: &CommandConfig) -> Self {
        Self::new(command.program.clone(), command.args.clone())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the program on `input`, passing output chunks to `on_output` as they arrive.
    pub async fn run(
        &self,
        input: &str,
        mut on_output: impl FnMut(OutputItem),
    ) -> SessionResult<ProcessOutput> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.error(format!("failed to spawn: {e}")))?;

        let (Some(mut stdin), Some(mut stdout_pipe), Some(mut stderr_pipe)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(self.error("child pipes were not captured".to_string()));
        };

        // Feed stdin concurrently so a program that writes before reading all input
        // cannot deadlock against us.
        let input = input.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut stdout_buf = vec![0u8; READ_CHUNK];
        let mut stderr_buf = vec![0u8; READ_CHUNK];
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut stdout_text = Utf8Chunks::default();
        let mut stderr_text = Utf8Chunks::default();
        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout_pipe.read(&mut stdout_buf), if stdout_open => {
                    let n = read.map_err(|e| self.error(format!("failed to read stdout: {e}")))?;
                    if n == 0 {
                        stdout_open = false;
                        emit(stdout_text.finish(), &mut on_output, OutputItem::stdout);
                    } else {
                        stdout.extend_from_slice(&stdout_buf[..n]);
                        emit(stdout_text.push(&stdout_buf[..n]), &mut on_output, OutputItem::stdout);
                    }
                }
                read = stderr_pipe.read(&mut stderr_buf), if stderr_open => {
                    let n = read.map_err(|e| self.error(format!("failed to read stderr: {e}")))?;
                    if n == 0 {
                        stderr_open = false;
                        emit(stderr_text.finish(), &mut on_output, OutputItem::stderr);
                    } else {
                        stderr.extend_from_slice(&stderr_buf[..n]);
                        emit(stderr_text.push(&stderr_buf[..n]), &mut on_output, OutputItem::stderr);
                    }
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|e| self.error(format!("failed to wait for exit: {e}")))?;
        // A program may exit without reading its input; a broken pipe is not an error.
        if let Ok(Err(e)) = writer.await {
            tracing::debug!("{}: stdin not fully written: {}", self.program, e);
        }

        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
        })
    }

    fn error(&self, reason: String) -> SessionError {
        SessionError::Process {
            program: self.program.clone(),
            reason,
        }
    }
}

fn emit(text: String, on_output: &mut impl FnMut(OutputItem), item: fn(String) -> OutputItem) {
    if !text.is_empty() {
        on_output(item(text));
    }
}

/// Decodes a byte stream chunk by chunk, holding back a character split across reads.
#[derive(Debug, Default)]
struct Utf8Chunks {
    pending: Vec<u8>,
}

impl Utf8Chunks {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Incomplete sequence at the end: keep it for the next chunk.
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len() - incomplete_tail(&self.pending),
        };
        let text = String::from_utf8_lossy(&self.pending[..complete]).into_owned();
        self.pending.drain(..complete);
        text
    }

    /// Whatever is still held back, decoded lossily.
    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, possibly incomplete, multi-byte sequence.
fn incomplete_tail(bytes: &[u8]) -> usize {
    let start = bytes.len().saturating_sub(3);
    (start..bytes.len())
        .find(|&i| {
            std::str::from_utf8(&bytes[i..])
                .is_err_and(|e| e.valid_up_to() == 0 && e.error_len().is_none())
        })
        .map_or(0, |i| bytes.len() - i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn character_split_across_reads_is_not_mangled() {
        let mut chunks = Utf8Chunks::default();
        let bytes = "né".as_bytes();
        assert_eq!(chunks.push(&bytes[..2]), "n");
        assert_eq!(chunks.push(&bytes[2..]), "é");
        assert_eq!(chunks.finish(), "");
    }

    #[test]
    fn invalid_bytes_are_replaced_and_split_tail_kept() {
        let mut chunks = Utf8Chunks::default();
        let euro = "€".as_bytes();
        let mut first = vec![b'a', 0xff, b'b'];
        first.extend_from_slice(&euro[..2]);
        assert_eq!(chunks.push(&first), "a\u{fffd}b");
        assert_eq!(chunks.push(&euro[2..]), "€");
    }

    #[test]
    fn unfinished_character_is_flushed_at_end_of_stream() {
        let mut chunks = Utf8Chunks::default();
        assert_eq!(chunks.push(&[b'x', 0xe2, 0x82]), "x");
        assert_eq!(chunks.finish(), "\u{fffd}");
    }
}
