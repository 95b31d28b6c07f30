//! On-disk persistence for cache storage.
//!
//! Layout: an index file listing cache names in creation order, one JSON
//! document per cache, and a list of the active registrations so a restarted
//! host still has a controller. Bodies are base64-encoded. Files are written
//! to a temporary name and renamed into place.

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::{Cache, CacheEntry, CacheKey, CacheStorage, Caches};
use crate::ServiceWorkerError;

/// Name of the index file inside the cache directory.
pub const INDEX_FILE: &str = "caches.json";

/// Name of the registration list inside the cache directory.
pub const REGISTRATIONS_FILE: &str = "registrations.json";

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StorageIndex {
    version: u32,
    caches: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    name: String,
    file: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheDocument {
    name: String,
    entries: Vec<StoredEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    key: CacheKey,
    entry: CacheEntry,
}

/// An active registration as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub scope: String,
    pub script_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistrationList {
    version: u32,
    registrations: Vec<RegistrationRecord>,
}

fn persistence_error(path: &Path, err: impl std::fmt::Display) -> ServiceWorkerError {
    ServiceWorkerError::Persistence(format!("{}: {}", path.display(), err))
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ServiceWorkerError> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| persistence_error(path, e))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| persistence_error(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| persistence_error(path, e))
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ServiceWorkerError> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|e| persistence_error(path, e))?;
    serde_json::from_slice(&raw).map_err(|e| persistence_error(path, e))
}

impl CacheStorage {
    /// Write every cache to `dir`, creating it if needed.
    pub async fn save(&self, dir: &Path) -> Result<(), ServiceWorkerError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| persistence_error(dir, e))?;

        let mut index = StorageIndex {
            version: FORMAT_VERSION,
            caches: Vec::with_capacity(self.caches().len()),
        };

        for (i, cache) in self.caches().iter().enumerate() {
            let file = format!("cache-{i}.json");
            let mut entries: Vec<StoredEntry> = cache
                .entries()
                .map(|(key, entry)| StoredEntry {
                    key: key.clone(),
                    entry: entry.clone(),
                })
                .collect();
            entries.sort_by(|a, b| (&a.key.url, &a.key.method).cmp(&(&b.key.url, &b.key.method)));

            let document = CacheDocument {
                name: cache.name().to_string(),
                entries,
            };
            write_json(&dir.join(&file), &document).await?;
            debug!(cache = cache.name(), file = %file, "Cache written");

            index.caches.push(IndexEntry {
                name: cache.name().to_string(),
                file,
            });
        }

        // The index goes last so a torn save never references missing files.
        write_json(&dir.join(INDEX_FILE), &index).await?;
        info!(dir = %dir.display(), caches = index.caches.len(), "Cache storage saved");
        Ok(())
    }

    /// Restore storage from `dir`. A directory without an index is empty
    /// storage.
    pub async fn load(dir: &Path) -> Result<Self, ServiceWorkerError> {
        let index_path: PathBuf = dir.join(INDEX_FILE);
        if !tokio::fs::try_exists(&index_path)
            .await
            .map_err(|e| persistence_error(&index_path, e))?
        {
            debug!(dir = %dir.display(), "No cache index, starting empty");
            return Ok(Self::new());
        }

        let index: StorageIndex = read_json(&index_path).await?;
        if index.version != FORMAT_VERSION {
            return Err(persistence_error(
                &index_path,
                format!("unsupported format version {}", index.version),
            ));
        }

        let mut storage = Self::new();
        for item in index.caches {
            let document: CacheDocument = read_json(&dir.join(&item.file)).await?;
            let mut cache = Cache::new(&item.name);
            for stored in document.entries {
                cache.insert(stored.key, stored.entry);
            }
            storage.push(cache);
        }

        info!(dir = %dir.display(), caches = storage.caches().len(), "Cache storage loaded");
        Ok(storage)
    }
}

impl Caches {
    /// Persist the current storage to `dir`.
    pub async fn save(&self, dir: &Path) -> Result<(), ServiceWorkerError> {
        self.snapshot().await.save(dir).await
    }
}

/// Record the active registrations in `dir`.
pub async fn save_registrations(
    dir: &Path,
    registrations: &[RegistrationRecord],
) -> Result<(), ServiceWorkerError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| persistence_error(dir, e))?;
    let list = RegistrationList {
        version: FORMAT_VERSION,
        registrations: registrations.to_vec(),
    };
    write_json(&dir.join(REGISTRATIONS_FILE), &list).await?;
    debug!(dir = %dir.display(), count = registrations.len(), "Registrations saved");
    Ok(())
}

/// Read the registrations recorded in `dir`. None recorded is an empty list.
pub async fn load_registrations(dir: &Path) -> Result<Vec<RegistrationRecord>, ServiceWorkerError> {
    let path = dir.join(REGISTRATIONS_FILE);
    if !tokio::fs::try_exists(&path)
        .await
        .map_err(|e| persistence_error(&path, e))?
    {
        return Ok(Vec::new());
    }

    let list: RegistrationList = read_json(&path).await?;
    if list.version != FORMAT_VERSION {
        return Err(persistence_error(
            &path,
            format!("unsupported format version {}", list.version),
        ));
    }
    Ok(list.registrations)
}
