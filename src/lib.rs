//! git-annex external special remote for Backblaze B2.
//!
//! git-annex spawns this binary and speaks its external special remote
//! protocol over stdin/stdout; we translate each command into B2 native API
//! calls. Annexed content is stored one object per key, named
//! `prefix + key`, with B2's own SHA-1 verification on upload.

pub mod cache;
pub mod config;
pub mod progress;
pub mod protocol;
pub mod remote;
pub mod storage;
pub mod verify;
