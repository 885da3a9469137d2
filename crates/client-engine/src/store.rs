//! Object-store adapters: one S3 implementation for production, one
//! in-memory implementation for tests and dry runs.
//!
//! Put failures are classified into the credential-shaped classes the upload
//! loop reacts to; everything else is reported as-is and left to queue
//! visibility for retry.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use aws_sdk_s3::error::ProvideErrorMetadata;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ObjectCannedAcl, StorageClass};

/// String metadata attached to an uploaded object.
pub type ObjectMetadata = HashMap<String, String>;

/// A failed object put, classified by cause.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PutError {
    /// The store rejected our authorization outright.
    #[error("access denied putting {key}: {message}")]
    AccessDenied {
        /// Object key of the failed put.
        key: String,
        /// Service error message.
        message: String,
    },
    /// The access key id is unknown to the store (often a not-yet-propagated
    /// fresh credential).
    #[error("invalid access key putting {key}: {message}")]
    InvalidAccessKey {
        /// Object key of the failed put.
        key: String,
        /// Service error message.
        message: String,
    },
    /// Anything else: transport faults, throttling, server errors.
    #[error("object put failed for {key}: {message}")]
    Other {
        /// Object key of the failed put.
        key: String,
        /// Service error message.
        message: String,
    },
}

/// Write access to one bucket of the remote object store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket identifier, for logs.
    fn name(&self) -> &str;

    /// Store `body` under `key` with the given metadata.
    async fn put(&self, key: &str, body: Vec<u8>, metadata: ObjectMetadata)
        -> Result<(), PutError>;
}

/// S3-backed object store for one bucket.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    /// Wrap an S3 client scoped to `bucket`.
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), PutError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .acl(ObjectCannedAcl::Private)
            .storage_class(StorageClass::Standard)
            .set_metadata(Some(metadata))
            .body(ByteStream::from(body))
            .send()
            .await
            .map(|_| ())
            .map_err(|err| {
                let message = err
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                match err.code() {
                    Some("AccessDenied") => PutError::AccessDenied {
                        key: key.to_string(),
                        message,
                    },
                    Some("InvalidAccessKeyId") => PutError::InvalidAccessKey {
                        key: key.to_string(),
                        message,
                    },
                    _ => PutError::Other {
                        key: key.to_string(),
                        message,
                    },
                }
            })
    }
}

/// One object held by a [`MemStore`].
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Object body.
    pub body: Vec<u8>,
    /// Object metadata.
    pub metadata: ObjectMetadata,
}

/// Fault kinds a [`MemStore`] can be primed to return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// Behave like an `AccessDenied` service error.
    AccessDenied,
    /// Behave like an `InvalidAccessKeyId` service error.
    InvalidAccessKey,
    /// Behave like any other put failure.
    Other,
}

/// In-memory object store. Used by the test harness and by local dry runs;
/// plays the role zenith-style local storage plays next to the cloud backend.
#[derive(Default)]
pub struct MemStore {
    name: String,
    objects: Mutex<HashMap<String, StoredObject>>,
    faults: Mutex<Vec<InjectedFault>>,
}

impl MemStore {
    /// Create an empty store with a bucket name for logs.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Mutex::default(),
            faults: Mutex::default(),
        }
    }

    /// Queue a fault to be returned by the next put (FIFO).
    pub fn inject_fault(&self, fault: InjectedFault) {
        self.faults.lock().expect("fault lock poisoned").push(fault);
    }

    /// Fetch a stored object by key.
    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects
            .lock()
            .expect("object lock poisoned")
            .get(key)
            .cloned()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("object lock poisoned").len()
    }

    /// True when no object has been stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored keys, unordered.
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .expect("object lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: ObjectMetadata,
    ) -> Result<(), PutError> {
        let fault = {
            let mut faults = self.faults.lock().expect("fault lock poisoned");
            if faults.is_empty() {
                None
            } else {
                Some(faults.remove(0))
            }
        };
        match fault {
            Some(InjectedFault::AccessDenied) => {
                return Err(PutError::AccessDenied {
                    key: key.to_string(),
                    message: "injected".to_string(),
                })
            }
            Some(InjectedFault::InvalidAccessKey) => {
                return Err(PutError::InvalidAccessKey {
                    key: key.to_string(),
                    message: "injected".to_string(),
                })
            }
            Some(InjectedFault::Other) => {
                return Err(PutError::Other {
                    key: key.to_string(),
                    message: "injected".to_string(),
                })
            }
            None => {}
        }

        self.objects
            .lock()
            .expect("object lock poisoned")
            .insert(key.to_string(), StoredObject { body, metadata });
        Ok(())
    }
}
