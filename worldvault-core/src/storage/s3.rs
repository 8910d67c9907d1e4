/*!
S3-compatible object store implementation.

This module talks to AWS S3, MinIO and other S3-compatible services through
the official AWS SDK, with static credentials and path-style addressing.
*/

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::{ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, error, info, warn};

use super::{BackupObject, BucketProbe, ObjectStore};
use crate::config::{S3Settings, DEFAULT_S3_REGION};
use crate::{BackupError, Result};

/// S3-compatible object store
///
/// # Example
/// ```rust,no_run
/// use worldvault_core::config::S3Settings;
/// use worldvault_core::storage::{ObjectStore, S3ObjectStore};
///
/// # async fn demo() -> worldvault_core::Result<()> {
/// let settings = S3Settings::new("http://minio", 9000, "minioadmin", "minioadmin");
/// let store = S3ObjectStore::connect("backups", &settings, 64 * 1024 * 1024).await;
/// let backups = store.list_objects("world_").await?;
/// println!("{} backups", backups.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    region: String,
    multipart_threshold: u64,
}

impl S3ObjectStore {
    /// Build a client for `settings` and bind it to `bucket`
    ///
    /// Files larger than `multipart_threshold` bytes are uploaded in parts of
    /// that size.
    pub async fn connect(bucket: &str, settings: &S3Settings, multipart_threshold: u64) -> Self {
        let credentials = Credentials::new(
            settings.access_key.clone(),
            settings.secret_key.clone(),
            None,
            None,
            "worldvault-static",
        );
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(settings.endpoint_url.clone())
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(true)
            .build();

        info!(
            bucket = %bucket,
            endpoint = %settings.endpoint_url,
            region = %settings.region,
            "Initialized S3 object store"
        );

        Self::with_client(
            S3Client::from_conf(s3_config),
            bucket,
            &settings.region,
            multipart_threshold,
        )
    }

    /// Bind an already configured client to `bucket`
    pub fn with_client(client: S3Client, bucket: &str, region: &str, multipart_threshold: u64) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            region: region.to_string(),
            multipart_threshold,
        }
    }

    async fn put_single(&self, key: &str, path: &Path, size: u64) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| BackupError::upload(key, format!("Failed to open {}: {e}", path.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(size as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| BackupError::upload(key, describe_s3_error("put_object", &e)))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, path: &Path, size: u64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| BackupError::upload(key, describe_s3_error("create_multipart_upload", &e)))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BackupError::upload(key, "S3 returned no multipart upload id"))?
            .to_string();

        let parts = match self.upload_parts(key, path, size, &upload_id).await {
            Ok(parts) => parts,
            Err(e) => {
                self.abort_multipart(key, &upload_id).await;
                return Err(e);
            }
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();
        if let Err(e) = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
        {
            self.abort_multipart(key, &upload_id).await;
            return Err(BackupError::upload(
                key,
                describe_s3_error("complete_multipart_upload", &e),
            ));
        }
        Ok(())
    }

    async fn upload_parts(
        &self,
        key: &str,
        path: &Path,
        size: u64,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>> {
        let read_err =
            |e: std::io::Error| BackupError::upload(key, format!("Failed to read {}: {e}", path.display()));

        let mut file = tokio::fs::File::open(path).await.map_err(read_err)?;
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;

        while offset < size {
            let length = self.multipart_threshold.min(size - offset);
            let mut buffer = vec![0u8; length as usize];
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(read_err)?;
            file.read_exact(&mut buffer).await.map_err(read_err)?;

            debug!(key = %key, part_number, offset, length, "Uploading part");
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer))
                .send()
                .await
                .map_err(|e| BackupError::upload(key, describe_s3_error("upload_part", &e)))?;

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            offset += length;
            part_number += 1;
        }
        Ok(parts)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(
                bucket = %self.bucket,
                key = %key,
                upload_id = %upload_id,
                error = %describe_s3_error("abort_multipart_upload", &e),
                "Failed to abort multipart upload"
            );
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn probe_bucket(&self) -> BucketProbe {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => BucketProbe::Present,
            Err(e) => {
                let not_found = e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false)
                    || e.raw_response()
                        .map(|r| r.status().as_u16() == 404)
                        .unwrap_or(false);
                if not_found {
                    BucketProbe::Absent
                } else {
                    BucketProbe::Failed(describe_s3_error("head_bucket", &e))
                }
            }
        }
    }

    async fn create_bucket(&self) -> Result<()> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);
        if self.region != DEFAULT_S3_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Created bucket");
                Ok(())
            }
            Err(e) => {
                let already_there = e
                    .as_service_error()
                    .map(|se| se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists())
                    .unwrap_or(false);
                if already_there {
                    debug!(bucket = %self.bucket, "Bucket already exists");
                    return Ok(());
                }
                let message = describe_s3_error("create_bucket", &e);
                error!(bucket = %self.bucket, error = %message, "Failed to create bucket");
                Err(BackupError::bucket(&self.bucket, message))
            }
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObject>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| BackupError::list(prefix, describe_s3_error("list_objects_v2", &e)))?;

            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                let last_modified = object
                    .last_modified()
                    .and_then(to_chrono)
                    .ok_or_else(|| {
                        BackupError::list(prefix, format!("object '{key}' has no usable last-modified time"))
                    })?;
                let size_bytes = listed_size(object.size()).ok_or_else(|| {
                    BackupError::list(prefix, format!("object '{key}' has no usable size"))
                })?;
                objects.push(BackupObject::new(key, size_bytes, last_modified));
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(
            bucket = %self.bucket,
            prefix = %prefix,
            count = objects.len(),
            "Listed S3 objects"
        );
        Ok(objects)
    }

    async fn put_object(&self, key: &str, path: &Path) -> Result<()> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| BackupError::upload(key, format!("Failed to stat {}: {e}", path.display())))?
            .len();

        info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            multipart = size > self.multipart_threshold,
            "Uploading backup to S3"
        );

        if size > self.multipart_threshold {
            self.put_multipart(key, path, size).await
        } else {
            self.put_single(key, path, size).await
        }
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = describe_s3_error("delete_object", &e);
                error!(bucket = %self.bucket, key = %key, error = %message, "Failed to delete object");
                BackupError::delete(key, message)
            })?;
        debug!(bucket = %self.bucket, key = %key, "Deleted object");
        Ok(())
    }
}

/// Convert an S3 timestamp to chrono
fn to_chrono(timestamp: &S3DateTime) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp.secs(), timestamp.subsec_nanos())
        .single()
}

/// Size of a listed object; missing or negative sizes are unusable
fn listed_size(size: Option<i64>) -> Option<u64> {
    size.and_then(|size| u64::try_from(size).ok())
}

/// Render AWS SDK errors with enough context to act on
fn describe_s3_error<E, R>(op: &str, error: &SdkError<E, R>) -> String
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match error {
        SdkError::DispatchFailure(_) => {
            format!("S3 {op} request failed to dispatch: {}", DisplayErrorContext(error))
        }
        SdkError::TimeoutError(_) => format!("S3 {op} request timed out"),
        SdkError::ServiceError(service_err) => match service_err.err().code() {
            Some("AccessDenied") | Some("Forbidden") => format!(
                "S3 {op} access denied (check credentials and permissions)"
            ),
            Some("NoSuchBucket") => format!("S3 {op} failed: bucket not found"),
            Some(code) => format!(
                "S3 {op} service error ({code}): {}",
                service_err.err().message().unwrap_or("unknown error")
            ),
            None => format!("S3 {op} service error: {}", DisplayErrorContext(error)),
        },
        _ => format!("S3 {op} error: {}", DisplayErrorContext(error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::head_bucket::HeadBucketError;

    #[test]
    fn test_to_chrono() {
        let ts = S3DateTime::from_secs_and_nanos(1_700_000_000, 500);
        let converted = to_chrono(&ts).unwrap();
        assert_eq!(converted.timestamp(), 1_700_000_000);
        assert_eq!(converted.timestamp_subsec_nanos(), 500);
    }

    #[test]
    fn test_listed_size_rejects_missing_and_negative() {
        assert_eq!(listed_size(Some(1024)), Some(1024));
        assert_eq!(listed_size(Some(0)), Some(0));
        assert_eq!(listed_size(None), None);
        assert_eq!(listed_size(Some(-1)), None);
    }

    #[test]
    fn test_timeout_error_description() {
        let error: SdkError<HeadBucketError> = SdkError::timeout_error("slow network");
        let message = describe_s3_error("head_bucket", &error);
        assert_eq!(message, "S3 head_bucket request timed out");
    }

    #[tokio::test]
    async fn test_connect_without_network() {
        // Building the client performs no I/O.
        let settings = S3Settings::new("http://127.0.0.1", 9, "key", "secret");
        let store = S3ObjectStore::connect("backups", &settings, 5 * 1024 * 1024).await;
        assert_eq!(store.bucket(), "backups");
    }
}
