//! Backblaze B2 native-API implementation of the storage seam.
//!
//! Speaks the v2 JSON API directly over reqwest; no SDK dependency. Uploads
//! stream the local file body and carry the precomputed SHA-1 so B2 verifies
//! integrity server-side. Retries are left to git-annex, which re-runs
//! failed transfers itself.

use async_trait::async_trait;
use base64::Engine;
use futures::TryStreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

use crate::config::RemoteConfig;
use crate::storage::{ByteStream, ObjectInfo, RemoteObject, RemoteStore, StoreConnector, StoreError};

const AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";

/// Percent-encode a B2 file name. Path separators stay literal; B2 treats
/// them as part of the name.
fn encode_name(name: &str) -> String {
    urlencoding::encode(name).replace("%2F", "/")
}

// =============================================================================
// API responses
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    account_id: String,
    authorization_token: String,
    api_url: String,
    download_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BucketEntry {
    bucket_id: String,
    bucket_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBucketsResponse {
    buckets: Vec<BucketEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileEntry {
    file_name: String,
    file_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFileNamesResponse {
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileInfoResponse {
    content_sha1: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadUrlResponse {
    upload_url: String,
    authorization_token: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
}

// =============================================================================
// Client
// =============================================================================

#[derive(Debug, Clone)]
struct Session {
    account_id: String,
    token: String,
    api_url: String,
    download_url: String,
}

/// One authorized bucket binding.
pub struct B2Store {
    http: Client,
    session: Session,
    bucket_id: String,
    bucket_name: String,
}

impl B2Store {
    async fn api_call<T: serde::de::DeserializeOwned>(
        http: &Client,
        session: &Session,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, StoreError> {
        let url = format!("{}/b2api/v2/{endpoint}", session.api_url);
        let resp = http
            .post(&url)
            .header("Authorization", &session.token)
            .json(&body)
            .send()
            .await?;
        decode_json(resp).await
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<T, StoreError> {
        Self::api_call(&self.http, &self.session, endpoint, body).await
    }
}

async fn decode_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, StoreError> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp
            .json::<ApiErrorBody>()
            .await
            .map(|e| e.message)
            .unwrap_or_default();
        return Err(StoreError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp.json::<T>().await?)
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = resp.status();
    if !status.is_success() {
        let message = resp
            .json::<ApiErrorBody>()
            .await
            .map(|e| e.message)
            .unwrap_or_default();
        return Err(StoreError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp)
}

#[async_trait]
impl RemoteStore for B2Store {
    async fn list_by_exact_name(&self, name: &str) -> Result<Option<RemoteObject>, StoreError> {
        let resp: ListFileNamesResponse = self
            .call(
                "b2_list_file_names",
                json!({
                    "bucketId": self.bucket_id,
                    "startFileName": name,
                    "maxFileCount": 1,
                }),
            )
            .await?;
        Ok(resp.files.into_iter().next().map(|f| RemoteObject {
            file_name: f.file_name,
            file_id: f.file_id,
        }))
    }

    async fn get_info(&self, file_id: &str) -> Result<ObjectInfo, StoreError> {
        let resp: FileInfoResponse = self
            .call("b2_get_file_info", json!({ "fileId": file_id }))
            .await?;
        Ok(ObjectInfo {
            content_sha1: resp.content_sha1,
        })
    }

    async fn upload(
        &self,
        name: &str,
        content: ByteStream,
        sha1_hex: &str,
        length: u64,
    ) -> Result<(), StoreError> {
        // Upload URLs are single-use; fetch a fresh one per upload.
        let target: UploadUrlResponse = self
            .call("b2_get_upload_url", json!({ "bucketId": self.bucket_id }))
            .await?;

        debug!(%name, length, "uploading");
        let body = reqwest::Body::wrap_stream(ReaderStream::new(content));
        let resp = self
            .http
            .post(&target.upload_url)
            .header("Authorization", &target.authorization_token)
            .header("X-Bz-File-Name", encode_name(name))
            .header("Content-Type", "b2/x-auto")
            .header("Content-Length", length)
            .header("X-Bz-Content-Sha1", sha1_hex)
            .body(body)
            .send()
            .await?;
        check_status(resp).await?;
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<ByteStream, StoreError> {
        let url = format!(
            "{}/file/{}/{}",
            self.session.download_url,
            urlencoding::encode(&self.bucket_name),
            encode_name(name),
        );
        let resp = self
            .http
            .get(&url)
            .header("Authorization", &self.session.token)
            .send()
            .await?;
        let resp = check_status(resp).await?;
        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    async fn delete_version(&self, name: &str, file_id: &str) -> Result<(), StoreError> {
        let _: serde_json::Value = self
            .call(
                "b2_delete_file_version",
                json!({ "fileName": name, "fileId": file_id }),
            )
            .await?;
        Ok(())
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Authorizes an account and binds to the configured bucket.
#[derive(Debug, Default)]
pub struct B2Connector {
    http: Client,
}

impl B2Connector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn authorize(&self, config: &RemoteConfig) -> Result<Session, StoreError> {
        let credential = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", config.account_id, config.app_key));
        let resp = self
            .http
            .get(AUTHORIZE_URL)
            .header("Authorization", format!("Basic {credential}"))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .json::<ApiErrorBody>()
                .await
                .map(|e| e.message)
                .unwrap_or_default();
            return Err(StoreError::Auth(format!("{status}: {message}")));
        }
        let auth: AuthorizeResponse = resp.json().await?;
        Ok(Session {
            account_id: auth.account_id,
            token: auth.authorization_token,
            api_url: auth.api_url,
            download_url: auth.download_url,
        })
    }

    async fn find_bucket(
        &self,
        session: &Session,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        let resp: ListBucketsResponse = B2Store::api_call(
            &self.http,
            session,
            "b2_list_buckets",
            json!({
                "accountId": session.account_id,
                "bucketName": name,
            }),
        )
        .await?;
        Ok(resp
            .buckets
            .into_iter()
            .find(|b| b.bucket_name == name)
            .map(|b| b.bucket_id))
    }

    async fn create_bucket(&self, session: &Session, name: &str) -> Result<String, StoreError> {
        let resp: BucketEntry = B2Store::api_call(
            &self.http,
            session,
            "b2_create_bucket",
            json!({
                "accountId": session.account_id,
                "bucketName": name,
                "bucketType": "allPrivate",
            }),
        )
        .await?;
        Ok(resp.bucket_id)
    }
}

#[async_trait]
impl StoreConnector for B2Connector {
    async fn connect(
        &self,
        config: &RemoteConfig,
        may_create: bool,
    ) -> Result<Box<dyn RemoteStore>, StoreError> {
        let session = self.authorize(config).await?;

        let bucket_id = match self.find_bucket(&session, &config.bucket).await? {
            Some(id) => id,
            None if may_create => {
                info!(bucket = %config.bucket, "creating private bucket");
                self.create_bucket(&session, &config.bucket).await?
            }
            None => return Err(StoreError::BucketMissing(config.bucket.clone())),
        };

        Ok(Box::new(B2Store {
            http: self.http.clone(),
            session,
            bucket_id,
            bucket_name: config.bucket.clone(),
        }))
    }
}
