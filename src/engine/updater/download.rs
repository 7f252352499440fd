//! Package Download
//!
//! Streams package bytes into a temporary file while hashing them. The file
//! is deleted on drop, so an aborted or failed download leaves nothing behind.

use futures_util::{Stream, StreamExt};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::NamedTempFile;

use super::AgentError;
use crate::engine::hasher::ContentHasher;

/// Shared flag a caller sets to abort an in-flight download
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Fully received package, not yet verified
#[derive(Debug)]
pub struct DownloadedPackage {
    file: NamedTempFile,
    hash: String,
    size: u64,
}

impl DownloadedPackage {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Digest of the received bytes
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_bytes(&mut self) -> io::Result<Vec<u8>> {
        let file = self.file.as_file_mut();
        file.seek(SeekFrom::Start(0))?;
        let mut bytes = Vec::with_capacity(self.size as usize);
        file.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

/// Drain `stream` into a temp file under `dir`.
///
/// `on_progress` receives `(downloaded, total)`; `total` is 0 when unknown.
pub async fn download_to_temp<S, F>(
    mut stream: S,
    dir: &Path,
    total: u64,
    cancel: &CancelFlag,
    mut on_progress: F,
) -> Result<DownloadedPackage, AgentError>
where
    S: Stream<Item = Result<Vec<u8>, AgentError>> + Unpin,
    F: FnMut(u64, u64),
{
    let mut file = NamedTempFile::new_in(dir)?;
    let mut hasher = ContentHasher::new();

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            return Err(AgentError::Cancelled);
        }
        let chunk = chunk?;
        file.write_all(&chunk)?;
        hasher.update(&chunk);
        on_progress(hasher.len(), total);
    }
    if cancel.is_cancelled() {
        return Err(AgentError::Cancelled);
    }
    file.flush()?;

    let size = hasher.len();
    Ok(DownloadedPackage {
        file,
        hash: hasher.finalize(),
        size,
    })
}
