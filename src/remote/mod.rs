//! Command dispatcher: the external special remote state machine.
//!
//! One command line is read, fully processed and answered before the next
//! is read; the only concurrency is the background hash task inside a
//! single STORE. State is Uninitialized until the first successful
//! INITREMOTE/PREPARE, then Ready for the rest of the process lifetime.

use anyhow::{anyhow, Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::PresenceCache;
use crate::config::{self, RemoteConfig};
use crate::progress::{self, ProgressReader};
use crate::protocol::{Channel, Request};
use crate::storage::{RemoteStore, StoreConnector};
use crate::verify::DigestTask;

/// Ready-state bindings: everything setup resolves exactly once.
struct RemoteState {
    store: Box<dyn RemoteStore>,
    config: RemoteConfig,
    cache: PresenceCache,
}

/// The protocol-driving side of the remote.
pub struct SpecialRemote<R, W> {
    channel: Channel<R, W>,
    connector: Box<dyn StoreConnector>,
    state: Option<RemoteState>,
}

impl<R, W> SpecialRemote<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(channel: Channel<R, W>, connector: Box<dyn StoreConnector>) -> Self {
        Self {
            channel,
            connector,
            state: None,
        }
    }

    /// Serve the protocol until git-annex closes our stdin.
    pub async fn run(&mut self) -> Result<()> {
        self.channel.send("VERSION 1").await?;

        while let Some(line) = self.channel.recv().await? {
            self.dispatch(Request::parse(&line)).await?;
        }
        debug!("end of input, shutting down");
        Ok(())
    }

    async fn dispatch(&mut self, request: Request) -> Result<()> {
        match request {
            Request::InitRemote => self.setup("INITREMOTE", true).await,
            Request::Prepare => self.setup("PREPARE", false).await,
            Request::TransferStore { key, file } => {
                let outcome = self.store(&key, &file).await;
                self.respond_transfer("STORE", &key, outcome).await
            }
            Request::TransferRetrieve { key, file } => {
                let outcome = self.retrieve(&key, &file).await;
                self.respond_transfer("RETRIEVE", &key, outcome).await
            }
            Request::CheckPresent { key } => {
                let reply = match self.check_present(&key).await {
                    Ok(true) => format!("CHECKPRESENT-SUCCESS {key}"),
                    Ok(false) => format!("CHECKPRESENT-FAILURE {key}"),
                    Err(err) => {
                        warn!(%key, error = %err, "presence check failed");
                        format!("CHECKPRESENT-UNKNOWN {key}")
                    }
                };
                self.channel.send(&reply).await
            }
            Request::Remove { key } => {
                let reply = match self.remove(&key).await {
                    Ok(()) => format!("REMOVE-SUCCESS {key}"),
                    Err(err) => {
                        warn!(%key, error = %err, "remove failed");
                        format!("REMOVE-FAILURE {key} {err:#}")
                    }
                };
                self.channel.send(&reply).await
            }
            // Declared but unsupported: let git-annex apply its defaults.
            Request::GetCost | Request::GetAvailability | Request::WhereIs { .. } => {
                self.channel.send("UNSUPPORTED-REQUEST").await
            }
            Request::Unsupported => self.channel.send("UNSUPPORTED-REQUEST").await,
        }
    }

    async fn respond_transfer(&self, direction: &str, key: &str, outcome: Result<()>) -> Result<()> {
        match outcome {
            Ok(()) => {
                self.channel
                    .send(&format!("TRANSFER-SUCCESS {direction} {key}"))
                    .await
            }
            Err(err) => {
                warn!(%key, direction, error = %err, "transfer failed");
                self.channel
                    .send(&format!("TRANSFER-FAILURE {direction} {key} {err:#}"))
                    .await
            }
        }
    }

    // =========================================================================
    // Setup
    // =========================================================================

    /// INITREMOTE and PREPARE share one idempotent setup path and differ
    /// only in the response verb and whether a missing bucket may be
    /// created.
    async fn setup(&mut self, mode: &str, may_create: bool) -> Result<()> {
        if self.state.is_some() {
            // Already configured; do not re-authenticate.
            return self.channel.send(&format!("{mode}-SUCCESS")).await;
        }

        match self.setup_inner(may_create).await {
            Ok(state) => {
                self.state = Some(state);
                self.channel.send(&format!("{mode}-SUCCESS")).await
            }
            Err(err) => {
                warn!(error = %err, "setup failed");
                self.channel.send(&format!("{mode}-FAILURE {err:#}")).await
            }
        }
    }

    async fn setup_inner(&mut self, may_create: bool) -> Result<RemoteState> {
        let config = config::resolve(&mut self.channel).await?;
        let store = self
            .connector
            .connect(&config, may_create)
            .await
            .context("Couldn't open bucket")?;
        Ok(RemoteState {
            store,
            config,
            cache: PresenceCache::default(),
        })
    }

    fn state_mut(&mut self) -> Result<&mut RemoteState> {
        self.state
            .as_mut()
            .ok_or_else(|| anyhow!("remote is not configured; PREPARE has not run"))
    }

    // =========================================================================
    // Transfers
    // =========================================================================

    async fn store(&mut self, key: &str, file: &str) -> Result<()> {
        let sink = self.channel.sink();
        let state = self.state_mut()?;
        let name = state.config.remote_name(key);

        let fh = File::open(file)
            .await
            .with_context(|| format!("Couldn't open {file} for reading"))?;

        // Hash in the background while we ask the store about the name.
        let digest_task = DigestTask::spawn(fh);

        let existing = state
            .cache
            .lookup(state.store.as_ref(), &name)
            .await
            .context("Couldn't list filenames")?;

        let (fh, digest) = match existing {
            Some(obj) => {
                let info = state
                    .store
                    .get_info(&obj.file_id)
                    .await
                    .with_context(|| format!("Couldn't get file info for {}", obj.file_id))?;
                let (fh, digest) = digest_task.wait().await?;
                if digest.sha1_hex.eq_ignore_ascii_case(&info.content_sha1) {
                    debug!(%key, "content already stored, skipping upload");
                    return Ok(());
                }
                // Same name, different content. Delete the stale version so
                // superseded data does not accumulate in the bucket.
                state
                    .store
                    .delete_version(&name, &obj.file_id)
                    .await
                    .context("Couldn't delete old file version")?;
                state.cache.invalidate();
                (fh, digest)
            }
            None => digest_task.wait().await?,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = progress::forward(sink, rx);
        let reader = ProgressReader::new(fh, tx);
        let uploaded = state
            .store
            .upload(&name, Box::new(reader), &digest.sha1_hex, digest.length)
            .await;
        forwarder.await.context("Progress task panicked")??;
        uploaded.context("Couldn't upload file")?;

        state.cache.invalidate();
        Ok(())
    }

    async fn retrieve(&mut self, key: &str, file: &str) -> Result<()> {
        let sink = self.channel.sink();
        let state = self.state_mut()?;
        let name = state.config.remote_name(key);

        let body = state
            .store
            .download(&name)
            .await
            .context("Couldn't download file")?;

        let mut dest = File::create(file)
            .await
            .with_context(|| format!("Couldn't open {file} for writing"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let forwarder = progress::forward(sink, rx);
        let mut reader = ProgressReader::new(body, tx);
        let copied = tokio::io::copy(&mut reader, &mut dest).await;
        drop(reader);
        forwarder.await.context("Progress task panicked")??;

        // A partially written destination is left in place on failure;
        // git-annex discards failed transfers itself.
        copied.context("Couldn't download file")?;
        dest.flush().await?;
        Ok(())
    }

    async fn check_present(&mut self, key: &str) -> Result<bool> {
        let state = self.state_mut()?;
        let name = state.config.remote_name(key);
        let existing = state
            .cache
            .lookup(state.store.as_ref(), &name)
            .await
            .context("Couldn't list filenames")?;
        Ok(existing.is_some())
    }

    async fn remove(&mut self, key: &str) -> Result<()> {
        let state = self.state_mut()?;
        let name = state.config.remote_name(key);

        let existing = state
            .cache
            .lookup(state.store.as_ref(), &name)
            .await
            .context("Couldn't list filenames")?;

        let Some(obj) = existing else {
            // Already absent; removal is idempotent.
            return Ok(());
        };

        state
            .store
            .delete_version(&name, &obj.file_id)
            .await
            .context("Couldn't delete file version")?;
        state.cache.invalidate();
        Ok(())
    }
}
