use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::{
    primitives::ByteStream as AwsByteStream,
    types::{CompletedMultipartUpload, CompletedPart as AwsCompletedPart, ObjectCannedAcl},
    Client,
};
use bytes::Bytes;
use std::env;
use tracing::debug;

use crate::{
    BlobError, BlobResult, BlobStore, CompletedPart, MultipartBlobStore, ObjectSummary, PutResult,
    StoreCapabilities, UploadId,
};

/// S3 rejects non-final parts below 5 MiB
const S3_MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const S3_MAX_PARTS: u32 = 10_000;

/// Connection settings for an S3-compatible bucket (DigitalOcean Spaces, MinIO, AWS)
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint_url: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Base for public object URLs; defaults to `https://{bucket}.{endpoint host}`
    pub public_base_url: Option<String>,
    pub force_path_style: bool,
}

impl S3Config {
    /// Read `DO_SPACES_*` environment variables
    pub fn from_env() -> BlobResult<Self> {
        fn get_env(key: &str) -> BlobResult<String> {
            env::var(key).map_err(|_| BlobError::invalid(format!("{} environment variable required", key)))
        }

        Ok(Self {
            endpoint_url: get_env("DO_SPACES_ENDPOINT")?,
            region: get_env("DO_SPACES_REGION")?,
            bucket: get_env("DO_SPACES_BUCKET")?,
            access_key_id: get_env("DO_SPACES_KEY")?,
            secret_access_key: get_env("DO_SPACES_SECRET")?,
            public_base_url: env::var("DO_SPACES_PUBLIC_URL").ok(),
            force_path_style: env::var("DO_SPACES_PATH_STYLE")
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
        })
    }

    fn resolved_public_base(&self) -> String {
        if let Some(base) = &self.public_base_url {
            return base.trim_end_matches('/').to_string();
        }

        let (scheme, host) = self
            .endpoint_url
            .split_once("://")
            .unwrap_or(("https", self.endpoint_url.as_str()));
        let host = host.trim_end_matches('/');
        if self.force_path_style {
            format!("{}://{}/{}", scheme, host, self.bucket)
        } else {
            format!("{}://{}.{}", scheme, self.bucket, host)
        }
    }
}

/// Object store backed by the AWS SDK. Build it once at start-up and share it;
/// the underlying client pools its connections.
#[derive(Clone)]
pub struct S3CompatibleStore {
    client: Client,
    bucket: String,
    public_base: String,
}

impl S3CompatibleStore {
    pub async fn new(config: S3Config) -> Self {
        let public_base = config.resolved_public_base();
        let bucket = config.bucket.clone();
        let client = Self::create_client(config).await;
        Self {
            client,
            bucket,
            public_base,
        }
    }

    pub async fn from_env() -> BlobResult<Self> {
        Ok(Self::new(S3Config::from_env()?).await)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn create_client(config: S3Config) -> Client {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "lms-media",
        );

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .endpoint_url(config.endpoint_url)
            .load()
            .await;

        Client::from_conf(
            aws_sdk_s3::config::Builder::from(&aws_config)
                .force_path_style(config.force_path_style)
                .build(),
        )
    }

    fn map_aws_error(err: impl std::error::Error + Send + Sync + 'static) -> BlobError {
        BlobError::backend(err)
    }
}

#[async_trait]
impl BlobStore for S3CompatibleStore {
    async fn put(
        &self,
        key: &str,
        content_type: Option<&str>,
        body: Bytes,
    ) -> BlobResult<PutResult> {
        let size = body.len() as u64;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::PublicRead)
            .body(AwsByteStream::from(body));

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        let result = request.send().await.map_err(Self::map_aws_error)?;

        Ok(PutResult {
            location: Some(self.public_url(key)),
            etag: result.e_tag().map(str::to_string),
            size_bytes: size,
        })
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> BlobResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if err.as_service_error().map_or(false, |e| e.is_not_found()) => Ok(false),
            Err(err) => Err(Self::map_aws_error(err)),
        }
    }

    async fn list(&self, prefix: &str) -> BlobResult<Vec<ObjectSummary>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let result = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(Self::map_aws_error)?;

            for object in result.contents() {
                if let Some(key) = object.key() {
                    objects.push(ObjectSummary {
                        key: key.to_string(),
                        size_bytes: object.size().unwrap_or(0).max(0) as u64,
                        last_modified: object.last_modified().map(|dt| dt.secs()),
                    });
                }
            }

            match result.next_continuation_token() {
                Some(token) if result.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(objects)
    }

    fn public_url(&self, key: &str) -> String {
        format!("{}/{}", self.public_base, key)
    }

    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::basic().with_multipart(Some(S3_MIN_PART_SIZE), Some(S3_MAX_PARTS))
    }
}

#[async_trait]
impl MultipartBlobStore for S3CompatibleStore {
    async fn init_multipart(
        &self,
        key: &str,
        content_type: Option<&str>,
    ) -> BlobResult<UploadId> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::PublicRead);

        if let Some(ct) = content_type {
            request = request.content_type(ct);
        }

        let result = request.send().await.map_err(Self::map_aws_error)?;
        let upload_id = result
            .upload_id()
            .ok_or_else(|| BlobError::upload_failed(format!("no upload id returned for {}", key)))?;

        Ok(UploadId::from_string(upload_id.to_string()))
    }

    async fn put_part(
        &self,
        key: &str,
        upload_id: &UploadId,
        part_number: u32,
        body: Bytes,
    ) -> BlobResult<String> {
        let part_number = i32::try_from(part_number)
            .map_err(|_| BlobError::invalid(format!("part number {} out of range", part_number)))?;

        let result = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id.as_str())
            .part_number(part_number)
            .body(AwsByteStream::from(body))
            .send()
            .await
            .map_err(Self::map_aws_error)?;

        result
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| BlobError::upload_failed(format!("no eTag returned for part {}", part_number)))
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &UploadId,
        parts: Vec<CompletedPart>,
    ) -> BlobResult<PutResult> {
        let completed: Vec<AwsCompletedPart> = parts
            .iter()
            .map(|part| {
                AwsCompletedPart::builder()
                    .part_number(part.part_number as i32)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();

        let result = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id.as_str())
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(Self::map_aws_error)?;

        debug!("S3 completed {} at {:?}", key, result.location());

        Ok(PutResult {
            location: result.location().map(str::to_string),
            etag: result.e_tag().map(str::to_string),
            size_bytes: 0,
        })
    }

    async fn abort_multipart(&self, key: &str, upload_id: &UploadId) -> BlobResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id.as_str())
            .send()
            .await
            .map_err(Self::map_aws_error)?;
        Ok(())
    }
}
