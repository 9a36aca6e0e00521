//! S3 and MinIO blob store.

use async_trait::async_trait;
use aws_sdk_s3::config::{Builder as S3ConfigBuilder, Credentials, Region};
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use futures_util::{stream, StreamExt};
use md5::{Digest, Md5};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tracing::{debug, info, warn};

use super::{BlobBackend, BlobBody, PutOutcome, StoreError};
use crate::types::{ContentHash, RetryPolicy, S3Settings};

const DEFAULT_REGION: &str = "us-east-1";
const PRECONDITION_FAILED: u16 = 412;

/// Blob store on an S3-compatible service.
///
/// AWS and MinIO differ only in client configuration: MinIO needs an explicit
/// endpoint and path-style addressing.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
    region: String,
    key_prefix: String,
    retry: RetryPolicy,
    location_constraint: bool,
}

impl S3Backend {
    /// Connects to Amazon S3 using static credentials or the default provider chain.
    pub async fn aws(settings: &S3Settings, retry: RetryPolicy) -> Self {
        let shared = load_shared_config(settings).await;
        let client = Client::from_conf(S3ConfigBuilder::from(&shared).build());
        Self::with_client(client, settings, retry, true)
    }

    /// Connects to a MinIO server. `settings.endpoint` is required.
    pub async fn minio(settings: &S3Settings, retry: RetryPolicy) -> Result<Self, StoreError> {
        if settings.endpoint.is_none() {
            return Err(StoreError::Misconfigured(
                "MinIO backend requires an endpoint URL".to_string(),
            ));
        }
        let shared = load_shared_config(settings).await;
        let client = Client::from_conf(
            S3ConfigBuilder::from(&shared)
                .force_path_style(true)
                .build(),
        );
        Ok(Self::with_client(client, settings, retry, false))
    }

    fn with_client(
        client: Client,
        settings: &S3Settings,
        retry: RetryPolicy,
        location_constraint: bool,
    ) -> Self {
        Self {
            client,
            bucket: settings.bucket.clone(),
            region: settings.region.clone(),
            key_prefix: settings.key_prefix.clone(),
            retry,
            location_constraint,
        }
    }

    fn key(&self, hash: &ContentHash) -> String {
        hash.object_key(&self.key_prefix)
    }

    fn strategy(&self) -> std::iter::Take<FixedInterval> {
        FixedInterval::from_millis(self.retry.interval_ms).take(self.retry.max_retries)
    }

    /// Size of the object under `key`, or `None` if there is none.
    async fn stored_size(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = key.to_string();

        Retry::spawn(self.strategy(), || {
            let client = client.clone();
            let bucket = bucket.clone();
            let key = key.clone();

            async move {
                match client.head_object().bucket(&bucket).key(&key).send().await {
                    Ok(output) => Ok(output.content_length().map(|len| len.max(0) as u64)),
                    Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                        Ok(None)
                    }
                    Err(err) => {
                        warn!("HEAD {} failed: {}", key, DisplayErrorContext(&err));
                        RetryError::to_transient(unavailable("head", &key, err))
                    }
                }
            }
        })
        .await
    }

    /// Writes `body` to a local spool file, enforcing `size` and computing the MD5.
    async fn spool(
        &self,
        mut body: BlobBody,
        size: u64,
    ) -> Result<(tempfile::NamedTempFile, String), StoreError> {
        let temp = tempfile::NamedTempFile::new()?;
        let mut writer = BufWriter::new(tokio::fs::File::from_std(temp.as_file().try_clone()?));
        let mut hasher = Md5::new();
        let mut written: u64 = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(StoreError::Body)?;
            written += chunk.len() as u64;
            if written > size {
                return Err(StoreError::Body(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("body exceeds declared size of {} bytes", size),
                )));
            }
            hasher.update(&chunk);
            writer.write_all(&chunk).await?;
        }
        if written != size {
            return Err(StoreError::Body(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("body ended after {} of {} bytes", written, size),
            )));
        }
        writer.flush().await?;
        Ok((temp, format!("{:x}", hasher.finalize())))
    }
}

async fn load_shared_config(settings: &S3Settings) -> aws_config::SdkConfig {
    let region = if settings.region.is_empty() {
        DEFAULT_REGION.to_string()
    } else {
        settings.region.clone()
    };
    let mut loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(Region::new(region));
    if let (Some(access_key), Some(secret_key)) =
        (&settings.access_key_id, &settings.secret_access_key)
    {
        loader = loader.credentials_provider(Credentials::new(
            access_key.clone(),
            secret_key.clone(),
            None,
            None,
            "snapvault-static",
        ));
    }
    if let Some(endpoint) = &settings.endpoint {
        loader = loader.endpoint_url(endpoint.clone());
    }
    loader.load().await
}

/// `If-None-Match: *` rejected the write because the key already exists.
fn precondition_failed(err: &SdkError<PutObjectError, HttpResponse>) -> bool {
    let status = err.raw_response().map(|r| r.status().as_u16());
    status == Some(PRECONDITION_FAILED)
        || err.as_service_error().and_then(|e| e.code()) == Some("PreconditionFailed")
}

fn unavailable<E: std::error::Error>(op: &str, key: &str, err: E) -> StoreError {
    StoreError::Unavailable(format!("{} {}: {}", op, key, DisplayErrorContext(err)))
}

#[async_trait]
impl BlobBackend for S3Backend {
    async fn ensure_bucket(&self) -> Result<(), StoreError> {
        if self
            .client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .is_ok()
        {
            debug!("Bucket {} already exists", self.bucket);
            return Ok(());
        }

        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.location_constraint && self.region != DEFAULT_REGION && !self.region.is_empty() {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("Created bucket {}", self.bucket);
                Ok(())
            }
            Err(err) => {
                let already_ours = err.as_service_error().is_some_and(|e| {
                    e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
                });
                if already_ours {
                    Ok(())
                } else {
                    Err(unavailable("create bucket", &self.bucket, err))
                }
            }
        }
    }

    async fn blob_exists(&self, hash: &ContentHash) -> Result<bool, StoreError> {
        let key = self.key(hash);
        let client = self.client.clone();
        let bucket = self.bucket.clone();

        Retry::spawn(self.strategy(), || {
            let client = client.clone();
            let bucket = bucket.clone();
            let key = key.clone();

            async move {
                match client.head_object().bucket(&bucket).key(&key).send().await {
                    Ok(_) => Ok(true),
                    Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => {
                        Ok(false)
                    }
                    Err(err) => {
                        warn!("HEAD {} failed: {}", key, DisplayErrorContext(&err));
                        RetryError::to_transient(unavailable("head", &key, err))
                    }
                }
            }
        })
        .await
    }

    async fn put_blob(
        &self,
        hash: &ContentHash,
        body: BlobBody,
        size: u64,
    ) -> Result<PutOutcome, StoreError> {
        let key = self.key(hash);
        // Kept alive until the upload finishes; deleted on drop.
        let (spool, md5) = self.spool(body, size).await?;
        let spool_path: PathBuf = spool.path().to_path_buf();
        let client = self.client.clone();
        let bucket = self.bucket.clone();

        let written = Retry::spawn(self.strategy(), || {
            let client = client.clone();
            let bucket = bucket.clone();
            let key = key.clone();
            let spool_path = spool_path.clone();
            let md5 = md5.clone();

            async move {
                let body = match ByteStream::from_path(&spool_path).await {
                    Ok(body) => body,
                    Err(err) => {
                        return RetryError::to_permanent(StoreError::Io(io::Error::other(
                            err.to_string(),
                        )))
                    }
                };
                let output = match client
                    .put_object()
                    .bucket(&bucket)
                    .key(&key)
                    .if_none_match("*")
                    .content_length(size as i64)
                    .body(body)
                    .send()
                    .await
                {
                    Ok(output) => output,
                    Err(err) if precondition_failed(&err) => return Ok(false),
                    Err(err) => {
                        warn!("PUT {} failed: {}", key, DisplayErrorContext(&err));
                        return RetryError::to_transient(unavailable("put", &key, err));
                    }
                };

                // ETag is the MD5 of the object for single-part uploads.
                if let Some(etag) = output.e_tag().map(|s| s.trim_matches('"')) {
                    if !etag.contains('-') && etag != md5 {
                        warn!("ETag mismatch for {}: expected {}, got {}", key, md5, etag);
                        return RetryError::to_transient(StoreError::Unavailable(format!(
                            "ETag mismatch for {}",
                            key
                        )));
                    }
                }
                Ok(true)
            }
        })
        .await?;
        drop(spool);

        if written {
            debug!(hash = %hash, bytes = size, "stored blob in bucket {}", self.bucket);
            return Ok(PutOutcome::Stored);
        }

        // The key was taken; keep the stored object and check it matches.
        let existing = self.stored_size(&key).await?;
        if existing != Some(size) {
            warn!(
                "{} already stored with {:?} bytes, upload declared {}",
                key, existing, size
            );
            return Err(StoreError::Conflict(key));
        }
        debug!(hash = %hash, "blob already present in bucket {}", self.bucket);
        Ok(PutOutcome::AlreadyStored)
    }

    async fn get_blob_stream(&self, hash: &ContentHash) -> Result<BlobBody, StoreError> {
        let key = self.key(hash);
        let client = self.client.clone();
        let bucket = self.bucket.clone();

        let output = Retry::spawn(self.strategy(), || {
            let client = client.clone();
            let bucket = bucket.clone();
            let key = key.clone();

            async move {
                match client.get_object().bucket(&bucket).key(&key).send().await {
                    Ok(output) => Ok(output),
                    Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                        RetryError::to_permanent(StoreError::NotFound(key))
                    }
                    Err(err) => {
                        warn!("GET {} failed: {}", key, DisplayErrorContext(&err));
                        RetryError::to_transient(unavailable("get", &key, err))
                    }
                }
            }
        })
        .await?;

        let body = stream::try_unfold(output.body, |mut body| async move {
            match body.try_next().await {
                Ok(Some(chunk)) => Ok(Some((chunk, body))),
                Ok(None) => Ok(None),
                Err(err) => Err(io::Error::other(err)),
            }
        });
        Ok(body.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::retry::RetryConfig;
    use aws_smithy_runtime::client::http::test_util::{ReplayEvent, StaticReplayClient};
    use aws_smithy_types::body::SdkBody;
    use futures_util::TryStreamExt;

    const ENDPOINT: &str = "http://localhost:9000";
    const HELLO_MD5: &str = "5d41402abc4b2a76b9719d911017c592";

    fn settings(endpoint: Option<&str>) -> S3Settings {
        S3Settings {
            bucket: "snapshots".to_string(),
            region: "us-east-1".to_string(),
            endpoint: endpoint.map(str::to_string),
            access_key_id: Some("minioadmin".to_string()),
            secret_access_key: Some("minioadmin".to_string()),
            key_prefix: "blobs".to_string(),
        }
    }

    #[tokio::test]
    async fn test_minio_requires_endpoint() {
        let err = S3Backend::minio(&settings(None), RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Misconfigured(_)));
    }

    async fn local_minio() -> S3Backend {
        S3Backend::minio(&settings(Some(ENDPOINT)), RetryPolicy::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_keys_use_prefix_and_shard() {
        let backend = local_minio().await;
        let hash = ContentHash::parse(&"f".repeat(64)).unwrap();
        assert_eq!(backend.key(&hash), format!("blobs/ff/{}", "f".repeat(62)));
    }

    #[tokio::test]
    async fn test_spool_enforces_declared_size() {
        let backend = local_minio().await;
        let body: BlobBody =
            stream::iter(vec![Ok(bytes::Bytes::from_static(b"hello world"))]).boxed();
        let err = backend.spool(body, 5).await.unwrap_err();
        assert!(matches!(err, StoreError::Body(_)));

        let body: BlobBody = stream::iter(vec![Ok(bytes::Bytes::from_static(b"hello"))]).boxed();
        let (spool, md5) = backend.spool(body, 5).await.unwrap();
        assert_eq!(md5, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(std::fs::read(spool.path()).unwrap(), b"hello");
    }

    fn object_uri() -> String {
        format!("{}/snapshots/blobs/aa/{}", ENDPOINT, "a".repeat(62))
    }

    fn request(method: &str, uri: &str) -> http::Request<SdkBody> {
        http::Request::builder()
            .method(method)
            .uri(uri)
            .body(SdkBody::empty())
            .unwrap()
    }

    fn response(
        status: u16,
        headers: &[(&str, &str)],
        body: impl Into<SdkBody>,
    ) -> http::Response<SdkBody> {
        let mut builder = http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(body.into()).unwrap()
    }

    fn error_xml(code: &str, message: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Error><Code>{}</Code><Message>{}</Message></Error>",
            code, message
        )
    }

    /// Backend whose HTTP traffic is answered by `events`, in order.
    fn replay_backend(
        events: Vec<ReplayEvent>,
        retry: RetryPolicy,
    ) -> (S3Backend, StaticReplayClient) {
        let http_client = StaticReplayClient::new(events);
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(Region::new(DEFAULT_REGION))
            .credentials_provider(Credentials::new("AKID", "SECRET", None, None, "replay"))
            .endpoint_url(ENDPOINT)
            .force_path_style(true)
            .retry_config(RetryConfig::disabled())
            .http_client(http_client.clone())
            .build();
        let backend = S3Backend::with_client(
            Client::from_conf(config),
            &settings(Some(ENDPOINT)),
            retry,
            false,
        );
        (backend, http_client)
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            interval_ms: 0,
            max_retries: 0,
        }
    }

    fn hash_a() -> ContentHash {
        ContentHash::parse(&"a".repeat(64)).unwrap()
    }

    fn hello() -> BlobBody {
        stream::iter(vec![Ok(bytes::Bytes::from_static(b"hello"))]).boxed()
    }

    #[tokio::test]
    async fn test_blob_exists_maps_head_status() {
        let uri = object_uri();
        let (backend, http) = replay_backend(
            vec![
                ReplayEvent::new(request("HEAD", &uri), response(404, &[], "")),
                ReplayEvent::new(
                    request("HEAD", &uri),
                    response(200, &[("content-length", "5")], ""),
                ),
            ],
            no_retry(),
        );

        assert!(!backend.blob_exists(&hash_a()).await.unwrap());
        assert!(backend.blob_exists(&hash_a()).await.unwrap());
        assert_eq!(http.actual_requests().count(), 2);
    }

    #[tokio::test]
    async fn test_get_stream_yields_body_and_maps_missing_key() {
        let uri = object_uri();
        let (backend, _http) = replay_backend(
            vec![
                ReplayEvent::new(
                    request("GET", &uri),
                    response(200, &[("content-length", "5")], "hello"),
                ),
                ReplayEvent::new(
                    request("GET", &uri),
                    response(404, &[], error_xml("NoSuchKey", "The specified key does not exist.")),
                ),
            ],
            no_retry(),
        );

        let body = backend.get_blob_stream(&hash_a()).await.unwrap();
        let chunks: Vec<bytes::Bytes> = body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"hello");

        let err = backend.get_blob_stream(&hash_a()).await.err().unwrap();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_put_is_conditional_and_checks_etag() {
        let uri = object_uri();
        let good_etag = format!("\"{}\"", HELLO_MD5);
        let (backend, http) = replay_backend(
            vec![
                ReplayEvent::new(
                    request("PUT", &uri),
                    response(200, &[("etag", "\"00000000000000000000000000000000\"")], ""),
                ),
                ReplayEvent::new(
                    request("PUT", &uri),
                    response(200, &[("etag", good_etag.as_str())], ""),
                ),
            ],
            RetryPolicy {
                interval_ms: 0,
                max_retries: 1,
            },
        );

        let outcome = backend.put_blob(&hash_a(), hello(), 5).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);

        let requests: Vec<_> = http.actual_requests().collect();
        assert_eq!(requests.len(), 2);
        for req in requests {
            assert_eq!(req.headers().get("if-none-match"), Some("*"));
        }
    }

    #[tokio::test]
    async fn test_put_keeps_existing_object() {
        let uri = object_uri();
        let (backend, _http) = replay_backend(
            vec![
                ReplayEvent::new(
                    request("PUT", &uri),
                    response(412, &[], error_xml("PreconditionFailed", "Precondition failed")),
                ),
                ReplayEvent::new(
                    request("HEAD", &uri),
                    response(200, &[("content-length", "5")], ""),
                ),
                ReplayEvent::new(
                    request("PUT", &uri),
                    response(412, &[], error_xml("PreconditionFailed", "Precondition failed")),
                ),
                ReplayEvent::new(
                    request("HEAD", &uri),
                    response(200, &[("content-length", "6")], ""),
                ),
            ],
            no_retry(),
        );

        let outcome = backend.put_blob(&hash_a(), hello(), 5).await.unwrap();
        assert_eq!(outcome, PutOutcome::AlreadyStored);

        let err = backend.put_blob(&hash_a(), hello(), 5).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_ensure_bucket_accepts_owned_bucket() {
        let bucket_uri = format!("{}/snapshots", ENDPOINT);
        let (backend, http) = replay_backend(
            vec![
                ReplayEvent::new(request("HEAD", &bucket_uri), response(404, &[], "")),
                ReplayEvent::new(
                    request("PUT", &bucket_uri),
                    response(
                        409,
                        &[],
                        error_xml("BucketAlreadyOwnedByYou", "You already own this bucket"),
                    ),
                ),
                ReplayEvent::new(request("HEAD", &bucket_uri), response(404, &[], "")),
                ReplayEvent::new(
                    request("PUT", &bucket_uri),
                    response(500, &[], error_xml("InternalError", "Internal error")),
                ),
            ],
            no_retry(),
        );

        backend.ensure_bucket().await.unwrap();
        let err = backend.ensure_bucket().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(http.actual_requests().count(), 4);
    }
}
