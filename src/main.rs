use anyhow::Result;
use tracing_subscriber::EnvFilter;

use git_annex_remote_b2::protocol::Channel;
use git_annex_remote_b2::remote::SpecialRemote;
use git_annex_remote_b2::storage::b2::B2Connector;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the protocol; all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let channel = Channel::new(tokio::io::stdin(), tokio::io::stdout());
    let mut remote = SpecialRemote::new(channel, Box::new(B2Connector::new()));
    remote.run().await
}
