use super::{ObjectStorage, SourceFile, StorageClient};
use crate::connection::ConnectionString;
use crate::Result;
use aws_config::meta::region::RegionProviderChain;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_types::region::Region;
use snafu::{prelude::*, IntoError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// S3 always accepts a `CreateBucket` without a location constraint in this region, and rejects
/// one that names it explicitly
const DEFAULT_REGION: &str = "us-east-1";

/// Implementation of [`ObjectStorage`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3 {
    inner: Arc<S3Inner>,
}
struct S3Inner {
    bucket: String,
    region: String,
    s3_config: aws_sdk_s3::Config,
    client: aws_sdk_s3::Client,
}

impl S3 {
    pub(super) async fn new(connection: &ConnectionString, bucket: String) -> Self {
        let s3_config = make_s3_config(connection).await;
        let region = s3_config
            .region()
            .map(|region| region.to_string())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        Self {
            inner: Arc::new(S3Inner {
                bucket,
                region,
                client: aws_sdk_s3::Client::from_conf(s3_config.clone()),
                s3_config,
            }),
        }
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3({})", self.inner.bucket)
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3 {
    fn container(&self) -> &str {
        &self.inner.bucket
    }

    #[instrument(skip(self), fields(bucket = %self.inner.bucket, region = %self.inner.region))]
    async fn create_container_if_not_exists(&self) -> Result<bool> {
        let client = &self.inner.client;
        let bucket = &self.inner.bucket;

        match client.head_bucket().bucket(bucket).send().await {
            Ok(_) => {
                debug!("Bucket already exists");
                return Ok(false);
            }
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map_or(false, |service_error| service_error.is_not_found());

                if !not_found {
                    return Err(crate::error::HeadBucketSnafu {
                        bucket: bucket.clone(),
                    }
                    .into_error(e));
                }
            }
        }

        let mut request = client.create_bucket().bucket(bucket);
        if self.inner.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(
                        self.inner.region.as_str(),
                    ))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!("Created bucket");
                Ok(true)
            }
            Err(e) => {
                // Lost a race with another uploader creating the same bucket
                if e
                    .as_service_error()
                    .map_or(false, |service_error| {
                        service_error.is_bucket_already_owned_by_you()
                    })
                {
                    debug!("Bucket was created concurrently");
                    Ok(false)
                } else {
                    Err(crate::error::CreateBucketSnafu {
                        bucket: bucket.clone(),
                    }
                    .into_error(e))
                }
            }
        }
    }

    fn new_client(&self) -> Box<dyn StorageClient> {
        Box::new(S3Client {
            bucket: self.inner.bucket.clone(),
            client: aws_sdk_s3::Client::from_conf(self.inner.s3_config.clone()),
        })
    }
}

/// One pooled client, uploading into a single bucket
struct S3Client {
    bucket: String,
    client: aws_sdk_s3::Client,
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3Client({})", self.bucket)
    }
}

#[async_trait::async_trait]
impl StorageClient for S3Client {
    #[instrument(skip(self, source, cancel), fields(bucket = %self.bucket, path = %source.path.display(), len = source.len))]
    async fn upload(
        &self,
        key: &str,
        source: SourceFile,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let SourceFile { path, file, len } = source;

        // Streams the file from disk as the request body is sent, so the whole file is never held
        // in memory
        let body = ByteStream::read_from()
            .file(file)
            .build()
            .await
            .with_context(|_| crate::error::ReadSourceFileSnafu { path: path.clone() })?;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_length(len as i64)
            .body(body)
            .send();

        // Dropping the request future abandons the HTTP request
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Upload abandoned due to cancellation");
                crate::error::AbortedSnafu.fail()
            }
            result = request => {
                result.with_context(|_| crate::error::PutObjectSnafu {
                    bucket: self.bucket.clone(),
                    key: key.to_string(),
                })?;

                debug!("Upload complete");
                Ok(len)
            }
        }
    }
}

async fn make_s3_config(connection: &ConnectionString) -> aws_sdk_s3::Config {
    let region_provider = if let Some(region) = &connection.region {
        RegionProviderChain::first_try(Region::new(region.clone()))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else(DEFAULT_REGION)
    };
    let mut loader = aws_config::from_env().region(region_provider);

    if let Some(credentials) = &connection.credentials {
        loader = loader.credentials_provider(Credentials::from_keys(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            credentials.session_token.clone(),
        ));
    }
    let aws_config = loader.load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(endpoint) = &connection.endpoint {
        // S3-compatible services are usually addressed by IP or a single host name, which doesn't
        // work with virtual-hosted-style bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(endpoint.as_str().trim_end_matches('/'))
            .force_path_style(true);
    }

    s3_config_builder.build()
}
