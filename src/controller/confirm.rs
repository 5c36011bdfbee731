//! Operator confirmation gate
//!
//! Only `y` or `Y` proceeds. Any other answer re-prompts; the operator backs
//! out with Ctrl-C. A closed input stream is an error, never an implicit yes.

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Stdin, Stdout,
};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("input closed before confirmation")]
    Closed,

    #[error("failed to read confirmation: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for gating destructive steps behind an operator answer
#[async_trait]
pub trait Confirmer: Send + Sync {
    /// Returns once the operator has confirmed
    async fn confirm(&self, prompt: &str) -> Result<(), PromptError>;
}

/// Confirms everything (`--auto`)
pub struct AutoConfirm;

#[async_trait]
impl Confirmer for AutoConfirm {
    async fn confirm(&self, prompt: &str) -> Result<(), PromptError> {
        info!(prompt = %prompt, "Auto-confirmed");
        Ok(())
    }
}

/// Prompts on a writer and reads answers from one buffered reader
///
/// The reader lives as long as the confirmer, so answers piped in ahead of
/// time (`printf 'y\ny\n' | relabel ...`) stay buffered for later prompts.
pub struct LineConfirmer<R, W> {
    io: Mutex<(R, W)>,
}

impl<R, W> LineConfirmer<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        LineConfirmer {
            io: Mutex::new((reader, writer)),
        }
    }
}

/// Prompts on stdout and reads answers from stdin
pub type TerminalConfirmer = LineConfirmer<BufReader<Stdin>, Stdout>;

impl TerminalConfirmer {
    pub fn terminal() -> Self {
        LineConfirmer::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

#[async_trait]
impl<R, W> Confirmer for LineConfirmer<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn confirm(&self, prompt: &str) -> Result<(), PromptError> {
        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;
        confirm_from(reader, writer, prompt).await
    }
}

/// Prompt on `writer` until `reader` yields a line that is `y` or `Y`
pub async fn confirm_from<R, W>(reader: &mut R, writer: &mut W, prompt: &str) -> Result<(), PromptError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = String::new();

    loop {
        writer
            .write_all(format!("{} [y|Y, Ctrl-C to abort]: ", prompt).as_bytes())
            .await?;
        writer.flush().await?;

        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Err(PromptError::Closed);
        }

        match line.trim() {
            "y" | "Y" => return Ok(()),
            other => warn!(answer = %other, "Unrecognized answer, asking again"),
        }
    }
}

/// Confirmer for tests: records prompts and answers from a fixed script
#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub struct ScriptedConfirmer {
    closed: bool,
    prompts: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl ScriptedConfirmer {
    /// Confirms every prompt
    pub fn accepting() -> Self {
        ScriptedConfirmer {
            closed: false,
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Behaves like a closed stdin
    pub fn closed() -> Self {
        ScriptedConfirmer {
            closed: true,
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
#[async_trait]
impl Confirmer for ScriptedConfirmer {
    async fn confirm(&self, prompt: &str) -> Result<(), PromptError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.closed {
            Err(PromptError::Closed)
        } else {
            Ok(())
        }
    }
}
