// Generic file-backed collection: one JSON document per entity, loaded fully
// into memory at open time. Writes go through a single writer lock per kind
// and are durable (temp file + atomic rename) before the call returns.

use crate::errors::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// Implemented by every persisted entity kind
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Directory name under the storage base dir
    const KIND: &'static str;

    fn id(&self) -> Uuid;

    /// Entities with a unique-name invariant return it here
    fn unique_name(&self) -> Option<&str> {
        None
    }
}

pub struct Collection<T> {
    dir: PathBuf,
    inner: RwLock<HashMap<Uuid, T>>,
}

impl<T: Entity> Collection<T> {
    /// Create the backing directory and load every record in it.
    /// A record that fails to parse is logged and skipped, never repaired.
    pub fn open(base_dir: &Path) -> Result<Self, StoreError> {
        let dir = base_dir.join(T::KIND);
        fs::create_dir_all(&dir)?;

        let mut loaded = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path).map_err(StoreError::from).and_then(|bytes| {
                serde_json::from_slice::<T>(&bytes).map_err(|e| StoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })
            }) {
                Ok(entity) => {
                    loaded.insert(entity.id(), entity);
                }
                Err(e) => {
                    warn!(kind = T::KIND, path = %path.display(), error = %e, "Skipping corrupt record");
                }
            }
        }

        Ok(Self {
            dir,
            inner: RwLock::new(loaded),
        })
    }

    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<T> {
        self.read_map().values().cloned().collect()
    }

    pub fn get(&self, id: Uuid) -> Result<T, StoreError> {
        self.read_map()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", T::KIND, id)))
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.read_map().contains_key(&id)
    }

    /// First entity matching the predicate, in no particular order
    pub fn find<F: Fn(&T) -> bool>(&self, pred: F) -> Option<T> {
        self.read_map().values().find(|e| pred(e)).cloned()
    }

    /// All entities matching the predicate
    pub fn filter<F: Fn(&T) -> bool>(&self, pred: F) -> Vec<T> {
        self.read_map()
            .values()
            .filter(|e| pred(e))
            .cloned()
            .collect()
    }

    /// Insert a new entity. Fails with AlreadyExists when the id is taken or
    /// the kind has a unique-name invariant and the name is taken.
    pub fn insert(&self, entity: T) -> Result<(), StoreError> {
        let mut map = self.write_map();
        if map.contains_key(&entity.id()) {
            return Err(StoreError::AlreadyExists(format!(
                "{} {}",
                T::KIND,
                entity.id()
            )));
        }
        if let Some(name) = entity.unique_name() {
            if map.values().any(|e| e.unique_name() == Some(name)) {
                return Err(StoreError::AlreadyExists(format!(
                    "{} named '{}'",
                    T::KIND,
                    name
                )));
            }
        }
        self.persist(&entity)?;
        map.insert(entity.id(), entity);
        Ok(())
    }

    /// Overwrite an existing entity. Fails with NotFound when absent and with
    /// AlreadyExists when renaming onto another entity's unique name.
    pub fn save(&self, entity: T) -> Result<(), StoreError> {
        let mut map = self.write_map();
        if !map.contains_key(&entity.id()) {
            return Err(StoreError::NotFound(format!(
                "{} {}",
                T::KIND,
                entity.id()
            )));
        }
        if let Some(name) = entity.unique_name() {
            if map
                .values()
                .any(|e| e.id() != entity.id() && e.unique_name() == Some(name))
            {
                return Err(StoreError::AlreadyExists(format!(
                    "{} named '{}'",
                    T::KIND,
                    name
                )));
            }
        }
        self.persist(&entity)?;
        map.insert(entity.id(), entity);
        Ok(())
    }

    /// Mutate an entity under the writer lock and persist the result.
    /// Returns the updated entity.
    pub fn update_with<F: FnOnce(&mut T)>(&self, id: Uuid, mutate: F) -> Result<T, StoreError> {
        let mut map = self.write_map();
        let entity = map
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", T::KIND, id)))?;
        mutate(entity);
        let updated = entity.clone();
        self.persist(&updated)?;
        Ok(updated)
    }

    pub fn delete(&self, id: Uuid) -> Result<T, StoreError> {
        let mut map = self.write_map();
        let entity = map
            .remove(&id)
            .ok_or_else(|| StoreError::NotFound(format!("{} {}", T::KIND, id)))?;
        let path = self.record_path(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(entity)
    }

    fn record_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    /// Durable write: serialize to a temp file in the same directory, then
    /// atomically rename over the final name.
    fn persist(&self, entity: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(entity)?;
        let tmp = self.dir.join(format!(".{}.json.tmp", entity.id()));
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, self.record_path(entity.id()))?;
        Ok(())
    }

    fn read_map(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, T>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_map(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, T>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
