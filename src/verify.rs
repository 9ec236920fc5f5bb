//! Background content verification for uploads.
//!
//! While the dispatcher asks the store whether a key already exists, a
//! spawned task streams the local file through SHA-1 and measures its
//! length, then rewinds the handle so the very same handle can feed the
//! upload. The `JoinHandle` is the one-shot completion signal; the
//! dispatcher joins it only at the point the digest is actually needed.

use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::JoinHandle;

const READ_CHUNK: usize = 64 * 1024;

/// Digest and length of one local file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub sha1_hex: String,
    pub length: u64,
}

/// In-flight hash computation for one STORE command.
pub struct DigestTask {
    handle: JoinHandle<Result<(File, FileDigest)>>,
}

impl DigestTask {
    /// Start hashing `file` in the background. Ownership of the handle moves
    /// into the task and comes back, rewound to offset 0, from [`wait`].
    ///
    /// [`wait`]: DigestTask::wait
    pub fn spawn(mut file: File) -> Self {
        let handle = tokio::spawn(async move {
            let mut hasher = Sha1::new();
            let mut length: u64 = 0;
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                let n = file
                    .read(&mut buf)
                    .await
                    .context("Couldn't read local file while hashing")?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                length += n as u64;
            }

            file.rewind()
                .await
                .context("Couldn't rewind local file after hashing")?;

            let digest = FileDigest {
                sha1_hex: hex::encode(hasher.finalize()),
                length,
            };
            Ok((file, digest))
        });
        Self { handle }
    }

    /// Join point: block until the digest is ready and take back the file
    /// handle, positioned at the start.
    pub async fn wait(self) -> Result<(File, FileDigest)> {
        self.handle.await.context("Hashing task panicked")?
    }
}
