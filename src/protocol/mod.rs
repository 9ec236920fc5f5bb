//! git-annex external special remote protocol: line framing and parsing.
//!
//! One command or response per line, UTF-8, `\n`-terminated. Responses are
//! flushed immediately so git-annex never stalls on a buffered reply.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::debug;

// =============================================================================
// Requests
// =============================================================================

/// A single inbound protocol line, classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    InitRemote,
    Prepare,
    TransferStore { key: String, file: String },
    TransferRetrieve { key: String, file: String },
    CheckPresent { key: String },
    Remove { key: String },
    /// Recognized but deliberately unsupported; answered with
    /// UNSUPPORTED-REQUEST so git-annex falls back to its defaults.
    GetCost,
    GetAvailability,
    WhereIs { key: String },
    Unsupported,
}

impl Request {
    /// Classify one inbound line. Never fails: anything unrecognized is
    /// `Unsupported`, keeping the channel usable for subsequent lines.
    pub fn parse(line: &str) -> Request {
        if line == "INITREMOTE" || line.starts_with("INITREMOTE ") {
            return Request::InitRemote;
        }
        if line == "PREPARE" || line.starts_with("PREPARE ") {
            return Request::Prepare;
        }
        if let Some(rest) = line.strip_prefix("TRANSFER ") {
            // Key first, then the file path, which may itself contain spaces.
            let mut fields = rest.splitn(3, ' ');
            let verb = fields.next().unwrap_or("");
            let key = fields.next().unwrap_or("").to_string();
            let file = fields.next().unwrap_or("").to_string();
            if key.is_empty() || file.is_empty() {
                return Request::Unsupported;
            }
            return match verb {
                "STORE" => Request::TransferStore { key, file },
                "RETRIEVE" => Request::TransferRetrieve { key, file },
                _ => Request::Unsupported,
            };
        }
        if let Some(key) = line.strip_prefix("CHECKPRESENT ") {
            if key.is_empty() {
                return Request::Unsupported;
            }
            return Request::CheckPresent {
                key: key.to_string(),
            };
        }
        if let Some(key) = line.strip_prefix("REMOVE ") {
            if key.is_empty() {
                return Request::Unsupported;
            }
            return Request::Remove {
                key: key.to_string(),
            };
        }
        if line == "GETCOST" {
            return Request::GetCost;
        }
        if line == "GETAVAILABILITY" {
            return Request::GetAvailability;
        }
        if let Some(key) = line.strip_prefix("WHEREIS ") {
            if key.is_empty() {
                return Request::Unsupported;
            }
            return Request::WhereIs {
                key: key.to_string(),
            };
        }
        Request::Unsupported
    }
}

// =============================================================================
// Line sink
// =============================================================================

/// Cloneable handle to the outbound half of the channel.
///
/// The progress forwarder writes PROGRESS lines through a clone of this while
/// the dispatcher still owns the channel, so the writer lives behind a mutex.
pub struct LineSink<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for LineSink<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W: AsyncWrite + Unpin + Send> LineSink<W> {
    /// Write one response line and flush it.
    pub async fn send(&self, line: &str) -> Result<()> {
        debug!(%line, "send");
        let mut w = self.inner.lock().await;
        w.write_all(line.as_bytes())
            .await
            .context("Couldn't write response line")?;
        w.write_all(b"\n")
            .await
            .context("Couldn't write response line")?;
        w.flush().await.context("Couldn't flush response line")?;
        Ok(())
    }
}

// =============================================================================
// Channel
// =============================================================================

/// The control channel: inbound command lines, outbound response lines.
pub struct Channel<R, W> {
    reader: BufReader<R>,
    sink: LineSink<W>,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: BufReader::new(reader),
            sink: LineSink {
                inner: Arc::new(Mutex::new(writer)),
            },
        }
    }

    /// A cloneable handle to the outbound side, for side-channel
    /// notifications emitted mid-transfer.
    pub fn sink(&self) -> LineSink<W> {
        self.sink.clone()
    }

    /// Read the next command line. `Ok(None)` means end of input, which is a
    /// clean shutdown, not an error.
    pub async fn recv(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .context("Couldn't read from the control channel")?;
        if n == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        debug!(%line, "recv");
        Ok(Some(line))
    }

    /// Write one response line and flush it.
    pub async fn send(&self, line: &str) -> Result<()> {
        self.sink.send(line).await
    }

    /// Ask git-annex for a configuration value via the GETCONFIG exchange.
    /// An empty string means the caller has no value for this name.
    pub async fn get_config(&mut self, name: &str) -> Result<String> {
        self.send(&format!("GETCONFIG {name}")).await?;
        let line = self
            .recv()
            .await?
            .with_context(|| format!("Channel closed while reading config variable {name}"))?;
        match line.strip_prefix("VALUE ") {
            Some(value) => Ok(value.to_string()),
            None => Ok(String::new()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, split, AsyncBufReadExt, BufReader};

    #[test]
    fn test_parse_setup_verbs() {
        assert_eq!(Request::parse("INITREMOTE"), Request::InitRemote);
        assert_eq!(Request::parse("PREPARE"), Request::Prepare);
    }

    #[test]
    fn test_parse_transfer() {
        assert_eq!(
            Request::parse("TRANSFER STORE SHA256E-s5--abc /tmp/x"),
            Request::TransferStore {
                key: "SHA256E-s5--abc".into(),
                file: "/tmp/x".into(),
            }
        );
        assert_eq!(
            Request::parse("TRANSFER RETRIEVE k /tmp/with space/file"),
            Request::TransferRetrieve {
                key: "k".into(),
                file: "/tmp/with space/file".into(),
            }
        );
        assert_eq!(Request::parse("TRANSFER STORE onlykey"), Request::Unsupported);
        assert_eq!(Request::parse("TRANSFER FROB k f"), Request::Unsupported);
    }

    #[test]
    fn test_parse_single_key_verbs() {
        assert_eq!(
            Request::parse("CHECKPRESENT k1"),
            Request::CheckPresent { key: "k1".into() }
        );
        assert_eq!(Request::parse("REMOVE k1"), Request::Remove { key: "k1".into() });
        assert_eq!(Request::parse("GETCOST"), Request::GetCost);
        assert_eq!(Request::parse("GETAVAILABILITY"), Request::GetAvailability);
        assert_eq!(Request::parse("WHEREIS k1"), Request::WhereIs { key: "k1".into() });
    }

    #[test]
    fn test_parse_garbage() {
        assert_eq!(Request::parse(""), Request::Unsupported);
        assert_eq!(Request::parse("EXPORT foo"), Request::Unsupported);
    }

    #[test]
    fn test_parse_rejects_empty_keys() {
        assert_eq!(Request::parse("CHECKPRESENT"), Request::Unsupported);
        assert_eq!(Request::parse("CHECKPRESENT "), Request::Unsupported);
        assert_eq!(Request::parse("REMOVE "), Request::Unsupported);
        assert_eq!(Request::parse("WHEREIS "), Request::Unsupported);
    }

    #[tokio::test]
    async fn test_channel_send_recv() -> anyhow::Result<()> {
        let (ours, theirs) = duplex(4096);
        let (their_read, mut their_write) = split(theirs);
        let (our_read, our_write) = split(ours);
        let mut channel = Channel::new(our_read, our_write);

        tokio::io::AsyncWriteExt::write_all(&mut their_write, b"CHECKPRESENT k\n").await?;
        assert_eq!(channel.recv().await?.as_deref(), Some("CHECKPRESENT k"));

        channel.send("CHECKPRESENT-SUCCESS k").await?;
        let mut reader = BufReader::new(their_read);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        assert_eq!(line, "CHECKPRESENT-SUCCESS k\n");

        tokio::io::AsyncWriteExt::shutdown(&mut their_write).await?;
        drop(their_write);
        assert_eq!(channel.recv().await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_get_config_exchange() -> anyhow::Result<()> {
        let (ours, theirs) = duplex(4096);
        let (their_read, mut their_write) = split(theirs);
        let (our_read, our_write) = split(ours);
        let mut channel = Channel::new(our_read, our_write);

        let driver = tokio::spawn(async move {
            let mut reader = BufReader::new(their_read);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "GETCONFIG bucket\n");
            tokio::io::AsyncWriteExt::write_all(&mut their_write, b"VALUE my-bucket\n")
                .await
                .unwrap();

            line.clear();
            reader.read_line(&mut line).await.unwrap();
            assert_eq!(line, "GETCONFIG prefix\n");
            tokio::io::AsyncWriteExt::write_all(&mut their_write, b"VALUE\n")
                .await
                .unwrap();
        });

        assert_eq!(channel.get_config("bucket").await?, "my-bucket");
        assert_eq!(channel.get_config("prefix").await?, "");
        driver.await?;
        Ok(())
    }
}
