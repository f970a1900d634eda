//! Remote sources backed by Amazon S3.
//!
//! [`S3Source`] uses the AWS SDK in-process. [`AwsCliSource`] shells out to
//! `aws s3 cp`, for images where the CLI carries credentials the SDK
//! cannot see (e.g. a profile configured only for the CLI).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::source::{truncate_output, FetchError, RemoteSource};

/// S3 bucket accessed through the AWS SDK.
pub struct S3Source {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Source {
    /// Build a client for `bucket` using the default credential chain.
    pub async fn connect(bucket: String, region: &str) -> Self {
        let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: aws_sdk_s3::Client::new(&shared),
            bucket,
        }
    }
}

#[async_trait]
impl RemoteSource for S3Source {
    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }

    async fn fetch(&self, key: &str, dest: &Path) -> Result<(), FetchError> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .is_some_and(|se| se.is_no_such_key());
                if missing {
                    FetchError::NotFound(self.uri(key))
                } else {
                    FetchError::Sdk(DisplayErrorContext(&e).to_string())
                }
            })?;

        let mut reader = object.body.into_async_read();
        let mut file = tokio::fs::File::create(dest).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(())
    }
}

/// S3 bucket accessed by running `aws s3 cp`.
pub struct AwsCliSource {
    program: String,
    bucket: String,
    region: String,
}

impl AwsCliSource {
    pub fn new(bucket: String, region: String) -> Self {
        Self::with_program("aws".to_string(), bucket, region)
    }

    /// Use a specific executable instead of `aws` from `PATH`.
    pub fn with_program(program: String, bucket: String, region: String) -> Self {
        Self {
            program,
            bucket,
            region,
        }
    }
}

#[async_trait]
impl RemoteSource for AwsCliSource {
    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }

    async fn fetch(&self, key: &str, dest: &Path) -> Result<(), FetchError> {
        let output = Command::new(&self.program)
            .arg("s3")
            .arg("cp")
            .arg(self.uri(key))
            .arg(dest)
            .arg("--region")
            .arg(&self.region)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() { stdout } else { stderr };
        Err(FetchError::CommandFailed {
            program: self.program.clone(),
            code: output.status.code().unwrap_or(-1),
            stderr: truncate_output(&detail),
        })
    }
}
