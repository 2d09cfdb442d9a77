//! S3-based history backend for shared, multi-operator use.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::config::Environment;
use crate::error::{Result, StateError};

use super::lock::LockInfo;
use super::store::HistoryStore;
use super::types::HistoryLog;

/// S3-based history store.
#[derive(Debug)]
pub struct S3HistoryStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3HistoryStore {
    /// Creates a new S3 history store from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 history store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
        }
    }

    fn history_key(&self, environment: Environment) -> String {
        format!("{}history/{environment}.json", self.prefix)
    }

    fn lock_key(&self, environment: Environment) -> String {
        format!("{}locks/{environment}.lock", self.prefix)
    }

    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| StateError::Corrupted {
                    message: format!("Invalid UTF-8 in S3 object: {e}"),
                })?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    async fn put_object(&self, key: &str, content: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(content) = self.get_object(key).await? else {
            debug!("No object at s3://{}/{key}", self.bucket);
            return Ok(None);
        };
        let value = serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
            message: format!("Failed to parse s3://{}/{key}: {e}", self.bucket),
        })?;
        Ok(Some(value))
    }

    async fn put_json<T: serde::Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|e| StateError::serialization(format!("Failed to serialize {key}: {e}")))?;
        self.put_object(key, content).await
    }
}

#[async_trait]
impl HistoryStore for S3HistoryStore {
    async fn load_log(&self, environment: Environment) -> Result<Option<HistoryLog>> {
        let key = self.history_key(environment);
        debug!("Loading history from s3://{}/{key}", self.bucket);
        self.get_json(&key).await
    }

    async fn save_log(&self, log: &HistoryLog) -> Result<()> {
        let key = self.history_key(log.environment);
        info!("Saving history to s3://{}/{key}", self.bucket);
        self.put_json(&key, log).await
    }

    async fn read_lock(&self, environment: Environment) -> Result<Option<LockInfo>> {
        self.get_json(&self.lock_key(environment)).await
    }

    async fn write_lock(&self, lock: &LockInfo) -> Result<()> {
        self.put_json(&self.lock_key(lock.environment), lock).await
    }

    async fn delete_lock(&self, environment: Environment) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.lock_key(environment))
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
