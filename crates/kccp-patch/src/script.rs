//! Patcher plugins.
//!
//! A patcher receives the canonical path and current bytes of an asset and
//! either returns replacement bytes or declines. The executable runner
//! invokes `<program> <canonical-path>` with the bytes on stdin.

use crate::error::{PatchError, PatchResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::{path::PathBuf, process::Stdio, time::Duration};
use tokio::{io::AsyncWriteExt, process::Command};
use tracing::{debug, warn};

/// A scripted asset rewrite
#[async_trait]
pub trait Patcher: Send + Sync + std::fmt::Debug {
    /// Rewrite `bytes`, or return `None` to leave the asset alone.
    async fn transform(&self, path: &str, bytes: &Bytes) -> Option<Bytes>;

    /// Stable identity mixed into the patch hash
    fn fingerprint(&self) -> String;
}

/// Runs an executable shipped in a pack
#[derive(Debug, Clone)]
pub struct ExecutablePatcher {
    program: PathBuf,
    digest: String,
    timeout: Duration,
}

impl ExecutablePatcher {
    /// Wrap `program`; `contents` are the script bytes used for the fingerprint
    pub fn new(program: impl Into<PathBuf>, contents: &[u8], timeout: Duration) -> Self {
        Self {
            program: program.into(),
            digest: format!("{:x}", md5::compute(contents)),
            timeout,
        }
    }

    /// Location of the executable
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    async fn run(&self, path: &str, bytes: &Bytes) -> PatchResult<Option<Bytes>> {
        let failure = |reason: String| PatchError::Script {
            program: self.program.clone(),
            reason,
        };

        let mut child = Command::new(&self.program)
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let input = bytes.clone();
            // A patcher that ignores stdin may close it early
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    debug!("Patcher closed stdin early: {}", e);
                }
            });
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| failure(format!("timed out after {:?}", self.timeout)))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!("{}: {}", output.status, stderr.trim())));
        }
        if output.stdout.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(output.stdout)))
    }
}

#[async_trait]
impl Patcher for ExecutablePatcher {
    async fn transform(&self, path: &str, bytes: &Bytes) -> Option<Bytes> {
        match self.run(path, bytes).await {
            Ok(result) => result,
            Err(e) => {
                warn!("{}, passing {} through", e, path);
                None
            }
        }
    }

    fn fingerprint(&self) -> String {
        self.digest.clone()
    }
}
