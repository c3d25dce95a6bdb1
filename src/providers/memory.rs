//! In-memory object store for tests
//!
//! Keeps objects in a `BTreeMap`, counts uploads and server-side copies, and
//! can be told to fail specific operations.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{ListPage, ObjectInfo, ObjectStore, PageToken, ProviderError, PutOptions, WriteResult};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    pub last_modified: i64,
    pub content_type: Option<String>,
    pub acl: Option<&'static str>,
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    /// Extra non-latest versions reported by versioned listings
    stale_versions: Mutex<Vec<ObjectInfo>>,
    pub puts: AtomicUsize,
    pub copies: AtomicUsize,
    pub deletes: AtomicUsize,
    pub list_calls: AtomicUsize,
    pub fail_puts: AtomicBool,
    pub fail_copies: AtomicBool,
    pub fail_deletes: AtomicBool,
    /// Fail listing calls once this many have succeeded
    pub fail_list_after: Mutex<Option<usize>>,
    pub clock: Mutex<i64>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        let store = Self::default();
        *store.clock.lock().unwrap() = 1_700_000_000;
        store
    }

    pub fn insert(&self, key: &str, body: &[u8]) {
        let now = *self.clock.lock().unwrap();
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body: body.to_vec(),
                last_modified: now,
                content_type: None,
                acl: None,
            },
        );
    }

    pub fn insert_stale_version(&self, key: &str, size: u64, version: &str) {
        let mut info = ObjectInfo::new(key, size, 1_600_000_000);
        info.version_id = Some(version.to_string());
        info.is_latest = false;
        self.stale_versions.lock().unwrap().push(info);
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn info(key: &str, object: &StoredObject) -> ObjectInfo {
        ObjectInfo::new(key, object.body.len() as u64, object.last_modified)
    }

    fn version_of(key: &str) -> String {
        format!("v-{}", key.len())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn display_name(&self) -> String {
        "memory://test".to_string()
    }

    async fn check_access(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn list_page(
        &self,
        prefix: &str,
        token: Option<&PageToken>,
        max_keys: usize,
        versions: bool,
    ) -> Result<ListPage, ProviderError> {
        let calls = self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(limit) = *self.fail_list_after.lock().unwrap() {
            if calls >= limit {
                return Err(ProviderError::NetworkError("connection reset".to_string()));
            }
        }

        let start_after = match token {
            Some(PageToken::Continuation(key)) => Some(key.clone()),
            Some(PageToken::Versions { key_marker, .. }) => Some(key_marker.clone()),
            None => None,
        };

        let objects = self.objects.lock().unwrap();
        let mut matching: Vec<ObjectInfo> = objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| start_after.as_ref().map_or(true, |after| key.as_str() > after.as_str()))
            .map(|(key, object)| {
                let mut info = Self::info(key, object);
                if versions {
                    info.version_id = Some(Self::version_of(key));
                }
                info
            })
            .collect();

        let more = matching.len() > max_keys;
        matching.truncate(max_keys);

        if versions {
            let stale = self.stale_versions.lock().unwrap();
            let keys: Vec<String> = matching.iter().map(|o| o.key.clone()).collect();
            matching.extend(stale.iter().filter(|s| keys.contains(&s.key)).cloned());
        }

        let next = if more {
            matching.iter().filter(|o| o.is_latest).last().map(|last| {
                if versions {
                    PageToken::Versions {
                        key_marker: last.key.clone(),
                        version_id_marker: last.version_id.clone(),
                    }
                } else {
                    PageToken::Continuation(last.key.clone())
                }
            })
        } else {
            None
        };

        Ok(ListPage { objects: matching, next })
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>, ProviderError> {
        Ok(self.objects.lock().unwrap().get(key).map(|o| Self::info(key, o)))
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, ProviderError> {
        self.object(key)
            .map(|o| o.body)
            .ok_or_else(|| ProviderError::NotFound(key.to_string()))
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        options: &PutOptions,
    ) -> Result<WriteResult, ProviderError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ProviderError::ServerError("injected PUT failure".to_string()));
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        let now = *self.clock.lock().unwrap();
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body,
                last_modified: now,
                content_type: options.content_type.clone(),
                acl: options.acl.map(|a| a.as_str()),
            },
        );
        Ok(WriteResult {
            version_id: Some(Self::version_of(key)),
        })
    }

    async fn copy_object(
        &self,
        from_key: &str,
        to_key: &str,
        options: &PutOptions,
    ) -> Result<WriteResult, ProviderError> {
        if self.fail_copies.load(Ordering::SeqCst) {
            return Err(ProviderError::ServerError("injected COPY failure".to_string()));
        }
        let source = self
            .object(from_key)
            .ok_or_else(|| ProviderError::NotFound(from_key.to_string()))?;
        self.copies.fetch_add(1, Ordering::SeqCst);
        let now = *self.clock.lock().unwrap();
        self.objects.lock().unwrap().insert(
            to_key.to_string(),
            StoredObject {
                body: source.body,
                last_modified: now,
                content_type: options.content_type.clone(),
                acl: options.acl.map(|a| a.as_str()),
            },
        );
        Ok(WriteResult::default())
    }

    async fn delete_object(&self, key: &str) -> Result<(), ProviderError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ProviderError::ServerError("injected DELETE failure".to_string()));
        }
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    fn object_url(&self, key: &str) -> String {
        format!("https://bucket.example.com/{}", key)
    }

    fn presigned_url(&self, key: &str, expires_in_secs: u64) -> Result<String, ProviderError> {
        Ok(format!("https://bucket.example.com/{}?X-Amz-Expires={}", key, expires_in_secs))
    }
}
