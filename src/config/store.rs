//! Mutex-guarded configuration store with binary persistence.
//!
//! The store owns the canonical record. Every other component takes a
//! short-lived snapshot and works on its own copy; the mutex is never
//! held across sensor reads, serial writes or PWM emission.

use std::sync::{Arc, Mutex};

use log::{info, warn};
use serde_json::Value;

use super::{blob, wire, Config};
use crate::ports::BlobStore;

/// Well-known blob name of the persisted image.
pub const CONFIG_BLOB: &str = "config";

pub struct ConfigStore {
    inner: Mutex<Inner>,
}

struct Inner {
    cfg: Config,
    blob: Box<dyn BlobStore + Send>,
}

impl ConfigStore {
    /// Mount the blob store and load the persisted record.
    ///
    /// On any failure — absent blob, length mismatch, short read — the
    /// record is populated with defaults and persisted best-effort.
    /// Returns the store and whether defaults were produced.
    pub fn init(mut blob: Box<dyn BlobStore + Send>) -> (Arc<Self>, bool) {
        let (cfg, defaulted) = match blob.load(CONFIG_BLOB) {
            Ok(bytes) => match blob::decode(&bytes) {
                Ok(cfg) => (cfg, false),
                Err(_) => {
                    warn!(
                        "config: stored image is {} bytes, expected {} — discarding",
                        bytes.len(),
                        blob::RECORD_SIZE
                    );
                    (Config::default(), true)
                }
            },
            Err(e) => {
                info!("config: no usable image ({e}), creating defaults");
                (Config::default(), true)
            }
        };

        let mut inner = Inner { cfg, blob };
        if defaulted {
            Self::persist_locked(&mut inner);
        }
        (
            Arc::new(Self {
                inner: Mutex::new(inner),
            }),
            defaulted,
        )
    }

    /// Copy the record out. The copy is the caller's; the lock is released
    /// before this returns.
    pub fn snapshot(&self) -> Config {
        self.inner.lock().unwrap().cfg.clone()
    }

    /// Merge a wire patch into the record and persist.
    /// Returns whether persistence succeeded.
    pub fn apply_patch(&self, patch: &Value) -> bool {
        let mut inner = self.inner.lock().unwrap();
        wire::apply_patch(&mut inner.cfg, patch);
        Self::persist_locked(&mut inner)
    }

    /// Reset to defaults and persist (factory reset).
    pub fn replace_with_defaults(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.cfg = Config::default();
        Self::persist_locked(&mut inner)
    }

    /// JSON projection of the current record.
    pub fn to_wire(&self) -> Value {
        wire::serialize(&self.inner.lock().unwrap().cfg)
    }

    fn persist_locked(inner: &mut Inner) -> bool {
        let image = blob::encode(&inner.cfg);
        match inner.blob.store(CONFIG_BLOB, &image) {
            Ok(()) => true,
            Err(e) => {
                // Non-fatal: the in-memory record stays authoritative.
                warn!("config: persist failed ({e})");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::nvs::MemBlobStore;
    use serde_json::json;

    #[test]
    fn fresh_store_produces_and_persists_defaults() {
        let backing = MemBlobStore::shared();
        let (store, defaulted) = ConfigStore::init(Box::new(backing.clone()));
        assert!(defaulted);
        assert_eq!(store.snapshot(), Config::default());

        // A second mount over the same backing loads what was persisted.
        let (store2, defaulted2) = ConfigStore::init(Box::new(backing));
        assert!(!defaulted2);
        assert_eq!(store2.snapshot(), Config::default());
    }

    #[test]
    fn size_mismatch_is_treated_as_corruption() {
        let backing = MemBlobStore::shared();
        {
            let mut b = backing.clone();
            b.store(CONFIG_BLOB, &[0xAB; 64]).unwrap();
        }
        let (store, defaulted) = ConfigStore::init(Box::new(backing));
        assert!(defaulted);
        assert_eq!(store.snapshot(), Config::default());
    }

    #[test]
    fn patch_survives_remount() {
        let backing = MemBlobStore::shared();
        let (store, _) = ConfigStore::init(Box::new(backing.clone()));
        assert!(store.apply_patch(&json!({"av": 9.5, "ui": {"d": 2000}})));

        let (store2, defaulted) = ConfigStore::init(Box::new(backing));
        assert!(!defaulted);
        let cfg = store2.snapshot();
        assert_eq!(cfg.converter_preset_v, 9.5);
        assert_eq!(cfg.intervals.lens_ms, 2000);
    }

    #[test]
    fn factory_reset_restores_defaults() {
        let backing = MemBlobStore::shared();
        let (store, _) = ConfigStore::init(Box::new(backing));
        store.apply_patch(&json!({"av": 5.0}));
        store.replace_with_defaults();
        assert_eq!(store.snapshot(), Config::default());
    }
}
