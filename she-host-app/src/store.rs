//! File-backed NVM keystore: one object file per slot, plus the
//! volatile cache that serves the RAM slot.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::warn;
use she_core::{KeyEntry, KeyId, KeyStore, KeyStoreError, SlotMeta, KEY_SIZE};

/// flags (1) || count (4, BE) || key (16)
const OBJECT_LEN: usize = 1 + 4 + KEY_SIZE;

pub struct NvmKeyStore {
    root: PathBuf,
    cache: BTreeMap<u16, KeyEntry>,
}

impl NvmKeyStore {
    pub fn open(root: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(root)?;
        Ok(NvmKeyStore {
            root: root.to_path_buf(),
            cache: BTreeMap::new(),
        })
    }

    fn object_path(&self, id: KeyId) -> PathBuf {
        self.root.join(format!("she_{:04x}.bin", id.raw()))
    }
}

impl KeyStore for NvmKeyStore {
    fn read_key(&self, id: KeyId) -> Result<KeyEntry, KeyStoreError> {
        if let Some(entry) = self.cache.get(&id.raw()) {
            return Ok(entry.clone());
        }
        let bytes = match fs::read(self.object_path(id)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(KeyStoreError::NotFound),
            Err(err) => {
                warn!("keystore read failed for {:#06x}: {}", id.raw(), err);
                return Err(KeyStoreError::Storage);
            }
        };
        if bytes.len() != OBJECT_LEN {
            warn!(
                "keystore object {:#06x} has length {}, expected {}",
                id.raw(),
                bytes.len(),
                OBJECT_LEN
            );
            return Err(KeyStoreError::Storage);
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes[5..]);
        Ok(KeyEntry {
            id,
            meta: SlotMeta {
                flags: bytes[0],
                count: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            },
            key,
        })
    }

    fn cache_key(&mut self, entry: KeyEntry) -> Result<(), KeyStoreError> {
        self.cache.insert(entry.id.raw(), entry);
        Ok(())
    }

    fn add_object(&mut self, entry: KeyEntry) -> Result<(), KeyStoreError> {
        let mut bytes = Vec::with_capacity(OBJECT_LEN);
        bytes.push(entry.meta.flags);
        bytes.extend_from_slice(&entry.meta.count.to_be_bytes());
        bytes.extend_from_slice(&entry.key);
        // A persisted object supersedes any cached copy.
        self.cache.remove(&entry.id.raw());
        fs::write(self.object_path(entry.id), &bytes).map_err(|err| {
            warn!("keystore write failed for {:#06x}: {}", entry.id.raw(), err);
            KeyStoreError::Storage
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use she_core::slot;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("she-nvm-test-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&root);
        root
    }

    fn entry(id: KeyId, count: u32) -> KeyEntry {
        KeyEntry {
            id,
            meta: SlotMeta { flags: 0x80, count },
            key: [0xC4; KEY_SIZE],
        }
    }

    #[test]
    fn persisted_objects_round_trip() {
        let root = temp_root("roundtrip");
        let mut store = NvmKeyStore::open(&root).unwrap();
        let id = KeyId::she(1, slot::KEY_1);

        store.add_object(entry(id, 7)).unwrap();
        let read = store.read_key(id).unwrap();
        assert_eq!(read, entry(id, 7));

        // Survives a reopen.
        let reopened = NvmKeyStore::open(&root).unwrap();
        assert_eq!(reopened.read_key(id).unwrap(), entry(id, 7));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn cached_objects_are_volatile() {
        let root = temp_root("cache");
        let mut store = NvmKeyStore::open(&root).unwrap();
        let id = KeyId::she(1, slot::RAM_KEY);

        store.cache_key(entry(id, 0)).unwrap();
        assert_eq!(store.read_key(id).unwrap(), entry(id, 0));

        let reopened = NvmKeyStore::open(&root).unwrap();
        assert_eq!(reopened.read_key(id), Err(KeyStoreError::NotFound));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn missing_object_is_not_found() {
        let root = temp_root("missing");
        let store = NvmKeyStore::open(&root).unwrap();
        assert_eq!(
            store.read_key(KeyId::she(1, slot::KEY_5)),
            Err(KeyStoreError::NotFound)
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn short_object_is_a_storage_error() {
        let root = temp_root("short");
        let store = NvmKeyStore::open(&root).unwrap();
        let id = KeyId::she(1, slot::KEY_2);
        fs::write(root.join(format!("she_{:04x}.bin", id.raw())), [0u8; 4]).unwrap();
        assert_eq!(store.read_key(id), Err(KeyStoreError::Storage));
        let _ = fs::remove_dir_all(&root);
    }
}
