//! NVS-backed blob store.
//!
//! The configuration image is one NVS blob in the `dewbox` namespace.
//! ESP-IDF NVS commits are atomic per `nvs_commit()`, which gives the
//! power-loss safety the persisted record needs for free. On the host
//! the store is an in-memory map shared between clones, so tests can
//! remount the "flash" and verify persistence.

use crate::ports::{BlobStore, StorageError};

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

#[cfg(target_os = "espidf")]
use log::{info, warn};

const NAMESPACE: &str = "dewbox";

// ── ESP-IDF backend ───────────────────────────────────────────

#[cfg(target_os = "espidf")]
pub struct NvsBlobStore {
    _private: (),
}

#[cfg(target_os = "espidf")]
impl NvsBlobStore {
    /// Initialise NVS flash. On first boot or after a partition-format
    /// version bump the partition is erased and re-initialised.
    pub fn new() -> Result<Self, StorageError> {
        // SAFETY: nvs_flash_init / nvs_flash_erase run from the single
        // main-task context before any concurrent NVS access.
        let ret = unsafe { nvs_flash_init() };
        if ret == ESP_ERR_NVS_NO_FREE_PAGES || ret == ESP_ERR_NVS_NEW_VERSION_FOUND {
            warn!("nvs: erasing and re-initialising flash partition");
            if unsafe { nvs_flash_erase() } != ESP_OK {
                return Err(StorageError::IoError);
            }
            if unsafe { nvs_flash_init() } != ESP_OK {
                return Err(StorageError::IoError);
            }
        } else if ret != ESP_OK {
            return Err(StorageError::IoError);
        }
        info!("nvs: flash initialised");
        Ok(Self { _private: () })
    }

    /// Open the namespace, run the closure, close the handle.
    fn with_handle<T>(
        write: bool,
        f: impl FnOnce(nvs_handle_t) -> Result<T, i32>,
    ) -> Result<T, i32> {
        let mut ns = [0u8; 16];
        let bytes = NAMESPACE.as_bytes();
        ns[..bytes.len()].copy_from_slice(bytes);

        let mode = if write {
            nvs_open_mode_t_NVS_READWRITE
        } else {
            nvs_open_mode_t_NVS_READONLY
        };

        let mut handle: nvs_handle_t = 0;
        let ret = unsafe { nvs_open(ns.as_ptr() as *const _, mode, &mut handle) };
        if ret != ESP_OK {
            return Err(ret);
        }
        let result = f(handle);
        unsafe { nvs_close(handle) };
        result
    }

    fn key_cell(key: &str) -> [u8; 16] {
        let mut cell = [0u8; 16];
        let bytes = key.as_bytes();
        let len = bytes.len().min(15);
        cell[..len].copy_from_slice(&bytes[..len]);
        cell
    }
}

#[cfg(target_os = "espidf")]
impl BlobStore for NvsBlobStore {
    fn load(&mut self, name: &str) -> Result<Vec<u8>, StorageError> {
        let key = Self::key_cell(name);
        let result = Self::with_handle(false, |handle| {
            // First call sizes the blob, second reads it.
            let mut size: usize = 0;
            let ret = unsafe {
                nvs_get_blob(
                    handle,
                    key.as_ptr() as *const _,
                    core::ptr::null_mut(),
                    &mut size,
                )
            };
            if ret != ESP_OK {
                return Err(ret);
            }

            let mut buf = vec![0u8; size];
            let ret = unsafe {
                nvs_get_blob(
                    handle,
                    key.as_ptr() as *const _,
                    buf.as_mut_ptr() as *mut _,
                    &mut size,
                )
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            buf.truncate(size);
            Ok(buf)
        });

        match result {
            Ok(bytes) => Ok(bytes),
            Err(e) if e == ESP_ERR_NVS_NOT_FOUND => Err(StorageError::NotFound),
            Err(e) => {
                warn!("nvs: read of '{name}' failed (rc={e})");
                Err(StorageError::IoError)
            }
        }
    }

    fn store(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let key = Self::key_cell(name);
        let result = Self::with_handle(true, |handle| {
            let ret = unsafe {
                nvs_set_blob(
                    handle,
                    key.as_ptr() as *const _,
                    data.as_ptr() as *const _,
                    data.len(),
                )
            };
            if ret != ESP_OK {
                return Err(ret);
            }
            let ret = unsafe { nvs_commit(handle) };
            if ret != ESP_OK {
                return Err(ret);
            }
            Ok(())
        });
        result.map_err(|e| {
            warn!("nvs: write of '{name}' failed (rc={e})");
            StorageError::IoError
        })
    }
}

// ── Host backend ──────────────────────────────────────────────

#[cfg(not(target_os = "espidf"))]
mod mem {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    /// In-memory blob store. Clones share the same backing map, so a
    /// test can hold one handle, hand another to a `ConfigStore`, and
    /// later remount to verify what was persisted.
    #[derive(Clone, Default)]
    pub struct MemBlobStore {
        blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    }

    impl MemBlobStore {
        pub fn shared() -> Self {
            Self::default()
        }
    }

    impl BlobStore for MemBlobStore {
        fn load(&mut self, name: &str) -> Result<Vec<u8>, StorageError> {
            self.blobs
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or(StorageError::NotFound)
        }

        fn store(&mut self, name: &str, data: &[u8]) -> Result<(), StorageError> {
            self.blobs
                .lock()
                .unwrap()
                .insert(name.to_string(), data.to_vec());
            Ok(())
        }
    }
}

#[cfg(not(target_os = "espidf"))]
pub use mem::MemBlobStore;
