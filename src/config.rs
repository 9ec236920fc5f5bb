//! Remote configuration: resolved once per process via the GETCONFIG
//! exchange, with environment fallbacks for credentials.

use anyhow::{bail, Result};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::Channel;

/// Environment fallback for the B2 account id.
pub const ENV_ACCOUNT_ID: &str = "B2_ACCOUNT_ID";

/// Environment fallback for the B2 application key.
pub const ENV_APP_KEY: &str = "B2_APP_KEY";

/// Everything needed to bind to one bucket.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub account_id: String,
    pub app_key: String,
    pub bucket: String,
    /// Either empty or ending in exactly one `/`.
    pub prefix: String,
}

impl RemoteConfig {
    /// The object-store name for a key: `prefix + key`.
    pub fn remote_name(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

/// Pull the remote's configuration from git-annex, falling back to the
/// environment for credentials. Fails with a message naming the missing
/// field so the user knows what to set.
pub async fn resolve<R, W>(channel: &mut Channel<R, W>) -> Result<RemoteConfig>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut account_id = channel.get_config("accountid").await?;
    if account_id.is_empty() {
        account_id = std::env::var(ENV_ACCOUNT_ID).unwrap_or_default();
    }
    if account_id.is_empty() {
        bail!("You must set accountid to the backblaze account id");
    }

    let mut app_key = channel.get_config("appkey").await?;
    if app_key.is_empty() {
        app_key = std::env::var(ENV_APP_KEY).unwrap_or_default();
    }
    if app_key.is_empty() {
        bail!("You must set appkey to the backblaze application key");
    }

    let bucket = channel.get_config("bucket").await?;
    if bucket.is_empty() {
        bail!("You must set bucket to the bucket name");
    }

    let prefix = normalize_prefix(&channel.get_config("prefix").await?);

    Ok(RemoteConfig {
        account_id,
        app_key,
        bucket,
        prefix,
    })
}

/// An empty prefix stays empty; anything else ends in exactly one `/`.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        return String::new();
    }
    format!("{}/", prefix.trim_end_matches('/'))
}
