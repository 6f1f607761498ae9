//! S3-compatible storage backend.
//!
//! The production home of job attachments: content-addressed blobs under
//! `{root}/Data/` and manifests under `{root}/Manifests/` in a single bucket.
//!
//! # Credentials
//!
//! Credentials are passed explicitly. Farms that rely on the ambient AWS
//! credential chain can build their own [`Client`] and use
//! [`S3Backend::from_client`].

use super::{ByteReader, ObjectInfoStream, check_streamed_size};
use crate::{
    ObjectInfo, StorageBackend,
    error::{ErrorKind, Result},
    key_of, validate_path,
};
use async_stream::stream;
use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::{BehaviorVersion, Credentials, Region, http::HttpResponse, retry::RetryConfig},
    error::{DisplayErrorContext, SdkError},
    primitives::{ByteStream, DateTime},
    types::{CompletedMultipartUpload, CompletedPart},
};
use exn::{OptionExt, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Generous default for concurrent S3 requests. The sync engine applies its
/// own, much smaller, transfer concurrency on top.
const DEFAULT_CONCURRENT_REQUESTS: usize = 100;

/// Objects up to this size go up in a single PutObject; bigger ones are sent
/// as multipart uploads with parts of at least this size.
const PART_SIZE: u64 = 8 * 1024 * 1024;

/// S3 refuses multipart uploads with more parts than this.
const MAX_PARTS: u64 = 10_000;

/// S3-compatible storage backend.
///
/// # Examples
///
/// ```no_run
/// use jattach_storage::backend::S3Backend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = S3Backend::new(
///     "farm-bucket",
///     "job-attachments-123456789012",
///     None,
///     "us-west-2",
///     None::<String>,
///     "access_key_id",
///     "secret_access_key",
/// ).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3Backend {
    name: String,
    client: Client,
    bucket: String,
    prefix: Option<String>,
    rate_limiter: Arc<Semaphore>,
}

impl S3Backend {
    /// Create a new S3 storage backend.
    ///
    /// # Arguments
    /// * `name` - A name for this backend (used in logging)
    /// * `bucket` - S3 bucket name
    /// * `prefix` - Optional key prefix applied beneath every key
    /// * `region` - AWS region or provider-specific region
    /// * `endpoint` - Custom endpoint URL for S3-compatible services
    /// * `key_id` - Access key ID
    /// * `key_secret` - Secret access key
    pub async fn new(
        name: impl Into<String>,
        bucket: impl Into<String>,
        prefix: Option<String>,
        region: impl Into<String>,
        endpoint: Option<impl Into<String>>,
        key_id: impl Into<String>,
        key_secret: impl Into<String>,
    ) -> Result<Self> {
        let credentials = Credentials::new(key_id, key_secret, None, None, "jattach-config");
        let mut config_builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(credentials)
            .region(Region::new(region.into()))
            // 1 initial attempt + 3 retries with exponential backoff
            .retry_config(RetryConfig::standard().with_max_attempts(4))
            // Path-style addressing for S3-compatible services (MinIO etc.)
            .force_path_style(true);
        if let Some(endpoint_url) = endpoint {
            config_builder = config_builder.endpoint_url(endpoint_url);
        }
        Self::from_client(name, Client::from_conf(config_builder.build()), bucket, prefix)
    }

    /// Wrap an already configured client.
    pub fn from_client(
        name: impl Into<String>,
        client: Client,
        bucket: impl Into<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        let prefix = prefix.map(key_of).transpose()?;
        Ok(Self {
            name: name.into(),
            client,
            bucket: bucket.into(),
            prefix,
            rate_limiter: Arc::new(Semaphore::new(DEFAULT_CONCURRENT_REQUESTS)),
        })
    }

    /// Construct the full S3 key from a relative key.
    fn full_key(&self, path: &Path) -> Result<String> {
        let key = key_of(path)?;
        Ok(match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key,
        })
    }

    /// Strip the configured prefix from an S3 key to get the relative key.
    fn relative_path(&self, key: &str) -> Result<PathBuf> {
        let relative = match &self.prefix {
            Some(prefix) => key.strip_prefix(prefix.as_str()).and_then(|s| s.strip_prefix('/')).unwrap_or(key),
            None => key,
        };
        validate_path(relative)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        self.rate_limiter
            .clone()
            .acquire_owned()
            .await
            .or_raise(|| ErrorKind::BackendError("S3 rate limiter closed".to_string()))
    }

    fn parse_datetime(dt: &DateTime) -> Result<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp_nanos(dt.as_nanos())
            .or_raise(|| ErrorKind::BackendError("S3 datetime out of range".to_string()))
    }

    fn object_info(key: PathBuf, size: Option<i64>, modified: Option<&DateTime>) -> Result<ObjectInfo> {
        let modified = match modified {
            Some(dt) => Self::parse_datetime(dt)?,
            None => OffsetDateTime::UNIX_EPOCH,
        };
        Ok(ObjectInfo::new(key, size.unwrap_or(0).max(0) as u64, modified))
    }

    /// Upload `source` in parts, holding at most one part in memory.
    async fn upload_parts(
        &self,
        path: &Path,
        key: &str,
        upload_id: &str,
        mut source: ByteReader,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let part_size = PART_SIZE.max(size.div_ceil(MAX_PARTS));
        let mut parts = Vec::new();
        let mut sent = 0u64;
        loop {
            let mut chunk = Vec::with_capacity(part_size.min(size.saturating_sub(sent)) as usize);
            (&mut source).take(part_size).read_to_end(&mut chunk).await.map_err(ErrorKind::Io)?;
            if chunk.is_empty() {
                break;
            }
            sent += chunk.len() as u64;
            let part_number = i32::try_from(parts.len() + 1)
                .or_raise(|| ErrorKind::BackendError(format!("too many parts for {}", path.display())))?;
            let _permit = self.acquire_permit().await?;
            let output = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_length(chunk.len() as i64)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|err| Self::map_sdk_error(&err, path, false))?;
            tracing::trace!(key, part_number, "uploaded part");
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(output.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
        }
        check_streamed_size(path, sent, size)?;
        Ok(parts)
    }

    /// Classify an SDK failure. `not_found` is the operation's own modeled
    /// "missing" error; bare 404s from S3-compatible services are caught by
    /// status code.
    fn map_sdk_error<E>(err: &SdkError<E, HttpResponse>, path: &Path, not_found: bool) -> ErrorKind
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let status = err.raw_response().map(|response| response.status().as_u16());
        match (err, status) {
            _ if not_found => ErrorKind::NotFound(path.to_path_buf()),
            (SdkError::TimeoutError(_) | SdkError::DispatchFailure(_), _) => {
                ErrorKind::Network(DisplayErrorContext(err).to_string())
            },
            (_, Some(404)) => ErrorKind::NotFound(path.to_path_buf()),
            (_, Some(401 | 403)) => ErrorKind::PermissionDenied(path.to_path_buf()),
            (_, Some(408 | 429 | 500..=599)) => ErrorKind::Network(DisplayErrorContext(err).to_string()),
            _ => ErrorKind::BackendError(DisplayErrorContext(err).to_string()),
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("s3://{}/{prefix}", self.bucket),
            None => format!("s3://{}", self.bucket),
        }
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> ObjectInfoStream<'a> {
        let validated_prefix = match prefix.map(validate_path).transpose() {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let key_prefix = match validated_prefix.as_deref().map(|p| self.full_key(p)).transpose() {
            Ok(key_prefix) => key_prefix.or_else(|| self.prefix.as_ref().map(|p| format!("{p}/"))),
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };

        Box::pin(stream! {
            let mut pages = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .set_prefix(key_prefix)
                .into_paginator()
                .send();
            loop {
                let page = {
                    let _permit = match self.acquire_permit().await {
                        Ok(permit) => permit,
                        Err(e) => { yield Err(e); break; },
                    };
                    pages.next().await
                };
                let page = match page {
                    Some(Ok(page)) => page,
                    Some(Err(err)) => {
                        let location = validated_prefix.clone().unwrap_or_default();
                        yield Err(exn::Exn::from(Self::map_sdk_error(&err, &location, false)));
                        break;
                    },
                    None => break,
                };
                for object in page.contents() {
                    let Some(key) = object.key() else { continue };
                    let relative = match self.relative_path(key) {
                        Ok(relative) => relative,
                        Err(e) => { yield Err(e); continue; },
                    };
                    // S3 prefixes are string-wise; ours are component-wise.
                    if let Some(pfx) = &validated_prefix
                        && !relative.starts_with(pfx)
                    {
                        continue;
                    }
                    yield Self::object_info(relative, object.size(), object.last_modified());
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                let not_found = err.as_service_error().is_some_and(|e| e.is_not_found());
                match Self::map_sdk_error(&err, path, not_found) {
                    ErrorKind::NotFound(_) => Ok(false),
                    kind => Err(exn::Exn::from(kind)),
                }
            },
        }
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output,
            Err(err) => {
                let not_found = err.as_service_error().is_some_and(|e| e.is_no_such_key());
                exn::bail!(Self::map_sdk_error(&err, path, not_found));
            },
        };
        let body = output.body.collect().await.or_raise(|| ErrorKind::Network(format!("reading body of {}", path.display())))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn reader(&self, path: &Path) -> Result<ByteReader> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output,
            Err(err) => {
                let not_found = err.as_service_error().is_some_and(|e| e.is_no_such_key());
                exn::bail!(Self::map_sdk_error(&err, path, not_found));
            },
        };
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(data.len() as i64)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(&err, path, false))?;
        Ok(())
    }

    async fn write_stream(&self, path: &Path, mut source: ByteReader, size: u64) -> Result<()> {
        if size <= PART_SIZE {
            let mut data = Vec::with_capacity(size as usize);
            source.read_to_end(&mut data).await.map_err(ErrorKind::Io)?;
            check_streamed_size(path, data.len() as u64, size)?;
            return self.write(path, &data).await;
        }

        let key = self.full_key(path)?;
        let upload_id = {
            let _permit = self.acquire_permit().await?;
            let output = self
                .client
                .create_multipart_upload()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|err| Self::map_sdk_error(&err, path, false))?;
            output
                .upload_id()
                .map(str::to_string)
                .ok_or_raise(|| ErrorKind::BackendError(format!("no upload id returned for {}", path.display())))?
        };

        let completed = match self.upload_parts(path, &key, &upload_id, source, size).await {
            Ok(parts) => {
                let _permit = self.acquire_permit().await?;
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&key)
                    .upload_id(&upload_id)
                    .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|err| exn::Exn::from(Self::map_sdk_error(&err, path, false)))
            },
            Err(e) => Err(e),
        };
        if completed.is_err() {
            // Uploaded parts are billed until the upload is aborted.
            let aborted =
                self.client.abort_multipart_upload().bucket(&self.bucket).key(&key).upload_id(&upload_id).send().await;
            if let Err(err) = aborted {
                tracing::warn!(key = %key, error = %DisplayErrorContext(&err), "failed to abort multipart upload");
            }
        }
        completed
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        // S3 deletes are idempotent; keep the NotFound contract of other backends.
        if !self.exists(path).await? {
            exn::bail!(ErrorKind::NotFound(validate_path(path)?));
        }
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| Self::map_sdk_error(&err, path, false))?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<ObjectInfo> {
        let relative = validate_path(path)?;
        let key = self.full_key(path)?;
        let _permit = self.acquire_permit().await?;
        let output = match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => output,
            Err(err) => {
                let not_found = err.as_service_error().is_some_and(|e| e.is_not_found());
                exn::bail!(Self::map_sdk_error(&err, path, not_found));
            },
        };
        Self::object_info(relative, output.content_length(), output.last_modified())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadOutput;
    use aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadOutput;
    use aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadOutput;
    use aws_sdk_s3::operation::get_object::{GetObjectError, GetObjectOutput};
    use aws_sdk_s3::operation::upload_part::UploadPartOutput;
    use aws_sdk_s3::operation::head_object::{HeadObjectError, HeadObjectOutput};
    use aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Output;
    use aws_sdk_s3::operation::put_object::PutObjectOutput;
    use aws_sdk_s3::types::Object;
    use aws_sdk_s3::types::error::{NoSuchKey, NotFound};
    use aws_smithy_mocks::{RuleMode, mock, mock_client};

    fn idle_client() -> Client {
        let unused = mock!(Client::head_object).then_output(|| HeadObjectOutput::builder().build());
        mock_client!(aws_sdk_s3, [&unused])
    }

    fn backend(client: Client, prefix: Option<&str>) -> S3Backend {
        S3Backend::from_client("s3", client, "bucket", prefix.map(str::to_string)).unwrap()
    }

    #[test]
    fn test_full_key() {
        let client = idle_client();
        let plain = backend(client.clone(), None);
        assert_eq!(plain.full_key(Path::new("Root/Data/abc.xxh128")).unwrap(), "Root/Data/abc.xxh128");
        let prefixed = backend(client, Some("tenant/"));
        assert_eq!(prefixed.full_key(Path::new("Root/Data/abc.xxh128")).unwrap(), "tenant/Root/Data/abc.xxh128");
        assert!(prefixed.full_key(Path::new("../escape")).is_err());
    }

    #[test]
    fn test_relative_path() {
        let client = idle_client();
        let prefixed = backend(client.clone(), Some("tenant"));
        assert_eq!(prefixed.relative_path("tenant/Root/Data/x").unwrap(), Path::new("Root/Data/x"));
        let plain = backend(client, None);
        assert_eq!(plain.relative_path("Root/Data/x").unwrap(), Path::new("Root/Data/x"));
    }

    #[tokio::test]
    async fn test_exists_maps_not_found_to_false() {
        let present = mock!(Client::head_object)
            .match_requests(|req| req.key() == Some("Root/Data/present.xxh128"))
            .then_output(|| HeadObjectOutput::builder().content_length(4).build());
        let missing = mock!(Client::head_object)
            .match_requests(|req| req.key() == Some("Root/Data/missing.xxh128"))
            .then_error(|| HeadObjectError::NotFound(NotFound::builder().build()));
        let client = mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&present, &missing]);
        let backend = backend(client, None);
        assert!(backend.exists(Path::new("Root/Data/present.xxh128")).await.unwrap());
        assert!(!backend.exists(Path::new("Root/Data/missing.xxh128")).await.unwrap());
        assert_eq!(present.num_calls(), 1);
        assert_eq!(missing.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_read() {
        let found = mock!(Client::get_object)
            .match_requests(|req| req.bucket() == Some("bucket") && req.key() == Some("Root/Data/abc.xxh128"))
            .then_output(|| GetObjectOutput::builder().body(ByteStream::from_static(b"blob")).build());
        let missing = mock!(Client::get_object)
            .match_requests(|req| req.key() == Some("Root/Data/gone.xxh128"))
            .then_error(|| GetObjectError::NoSuchKey(NoSuchKey::builder().build()));
        let client = mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&found, &missing]);
        let backend = backend(client, None);
        assert_eq!(backend.read(Path::new("Root/Data/abc.xxh128")).await.unwrap(), b"blob");
        let err = backend.read(Path::new("Root/Data/gone.xxh128")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_write_applies_prefix() {
        let put = mock!(Client::put_object)
            .match_requests(|req| req.key() == Some("tenant/Root/Manifests/abc_input"))
            .then_output(|| PutObjectOutput::builder().build());
        let client = mock_client!(aws_sdk_s3, [&put]);
        let backend = backend(client, Some("tenant"));
        backend.write(Path::new("Root/Manifests/abc_input"), b"{}").await.unwrap();
        assert_eq!(put.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_stat() {
        let head = mock!(Client::head_object).then_output(|| {
            HeadObjectOutput::builder()
                .content_length(12)
                .last_modified(DateTime::from_secs(1_700_000_000))
                .build()
        });
        let client = mock_client!(aws_sdk_s3, [&head]);
        let backend = backend(client, None);
        let info = backend.stat(Path::new("Root/Data/abc.xxh128")).await.unwrap();
        assert_eq!(info.path, Path::new("Root/Data/abc.xxh128"));
        assert_eq!(info.size, 12);
        assert_eq!(info.modified.unix_timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_list_filters_component_wise() {
        let list = mock!(Client::list_objects_v2)
            .match_requests(|req| req.prefix() == Some("Root/Data"))
            .then_output(|| {
                ListObjectsV2Output::builder()
                    .contents(Object::builder().key("Root/Data/a.xxh128").size(1).build())
                    .contents(Object::builder().key("Root/Database/b").size(2).build())
                    .build()
            });
        let client = mock_client!(aws_sdk_s3, [&list]);
        let backend = backend(client, None);
        let found = backend.list(Some(Path::new("Root/Data"))).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, Path::new("Root/Data/a.xxh128"));
        assert_eq!(found[0].size, 1);
    }

    #[test]
    fn test_identity_includes_bucket_and_prefix() {
        let client = idle_client();
        assert_eq!(backend(client.clone(), None).identity(), "s3://bucket");
        assert_eq!(backend(client.clone(), Some("tenant")).identity(), "s3://bucket/tenant");
        let other = S3Backend::from_client("s3", client, "other-bucket", None).unwrap();
        assert_ne!(other.identity(), backend(idle_client(), None).identity());
    }

    #[tokio::test]
    async fn test_reader_streams_body() {
        let get = mock!(Client::get_object)
            .then_output(|| GetObjectOutput::builder().body(ByteStream::from_static(b"streamed")).build());
        let client = mock_client!(aws_sdk_s3, [&get]);
        let backend = backend(client, None);
        let mut reader = backend.reader(Path::new("Root/Data/abc.xxh128")).await.unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"streamed");
    }

    #[tokio::test]
    async fn test_small_stream_is_a_single_put() {
        let put = mock!(Client::put_object)
            .match_requests(|req| req.content_length() == Some(4))
            .then_output(|| PutObjectOutput::builder().build());
        let client = mock_client!(aws_sdk_s3, [&put]);
        let backend = backend(client, None);
        let source: ByteReader = Box::pin(std::io::Cursor::new(b"blob".to_vec()));
        backend.write_stream(Path::new("Root/Data/abc.xxh128"), source, 4).await.unwrap();
        assert_eq!(put.num_calls(), 1);
    }

    #[tokio::test]
    async fn test_large_stream_is_multipart() {
        let create = mock!(Client::create_multipart_upload)
            .match_requests(|req| req.key() == Some("Root/Data/big.xxh128"))
            .then_output(|| CreateMultipartUploadOutput::builder().upload_id("upload-1").build());
        let first = mock!(Client::upload_part)
            .match_requests(|req| req.part_number() == Some(1) && req.upload_id() == Some("upload-1"))
            .then_output(|| UploadPartOutput::builder().e_tag("etag-1").build());
        let second = mock!(Client::upload_part)
            .match_requests(|req| req.part_number() == Some(2) && req.content_length() == Some(1))
            .then_output(|| UploadPartOutput::builder().e_tag("etag-2").build());
        let complete = mock!(Client::complete_multipart_upload)
            .match_requests(|req| {
                let parts = req.multipart_upload().map(|upload| upload.parts()).unwrap_or_default();
                parts.len() == 2 && parts[1].e_tag() == Some("etag-2")
            })
            .then_output(|| CompleteMultipartUploadOutput::builder().build());
        let abort = mock!(Client::abort_multipart_upload).then_output(|| AbortMultipartUploadOutput::builder().build());
        let client = mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&create, &first, &second, &complete, &abort]);
        let backend = backend(client, None);

        let size = PART_SIZE + 1;
        let source: ByteReader = Box::pin(std::io::Cursor::new(vec![7u8; size as usize]));
        backend.write_stream(Path::new("Root/Data/big.xxh128"), source, size).await.unwrap();
        assert_eq!(create.num_calls(), 1);
        assert_eq!(first.num_calls(), 1);
        assert_eq!(second.num_calls(), 1);
        assert_eq!(complete.num_calls(), 1);
        assert_eq!(abort.num_calls(), 0);
    }

    #[tokio::test]
    async fn test_short_multipart_stream_is_aborted() {
        let create = mock!(Client::create_multipart_upload)
            .then_output(|| CreateMultipartUploadOutput::builder().upload_id("upload-2").build());
        let part = mock!(Client::upload_part).then_output(|| UploadPartOutput::builder().e_tag("etag-1").build());
        let complete =
            mock!(Client::complete_multipart_upload).then_output(|| CompleteMultipartUploadOutput::builder().build());
        let abort = mock!(Client::abort_multipart_upload)
            .match_requests(|req| req.upload_id() == Some("upload-2"))
            .then_output(|| AbortMultipartUploadOutput::builder().build());
        let client = mock_client!(aws_sdk_s3, RuleMode::MatchAny, [&create, &part, &complete, &abort]);
        let backend = backend(client, None);

        // Claims two parts' worth but only delivers one.
        let source: ByteReader = Box::pin(std::io::Cursor::new(vec![7u8; PART_SIZE as usize]));
        let err = backend.write_stream(Path::new("Root/Data/cut.xxh128"), source, PART_SIZE * 2).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::BackendError(_)));
        assert_eq!(complete.num_calls(), 0);
        assert_eq!(abort.num_calls(), 1);
    }
}
