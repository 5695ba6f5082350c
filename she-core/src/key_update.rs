//! Authenticated key update (M1..M5) and RAM key export.
//!
//! The client proves knowledge of the auth key named by M1's AuthID;
//! the new slot value travels CBC-encrypted in M2 and is bound to the
//! request by the CMAC in M3. M4/M5 confirm the write under keys
//! derived from the freshly installed value.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use she_kdf::derive_key;
use zeroize::Zeroizing;

use crate::cipher::encrypt_block;
use crate::codec::{self, M1_SIZE, M2_SIZE, M3_SIZE, M4_SIZE};
use crate::constants::{KEY_UPDATE_ENC_C, KEY_UPDATE_MAC_C};
use crate::keystore::{key_flag, slot, KeyEntry, KeyStore, KeyStoreError, SlotMeta};
use crate::{RamKeyExport, Reply, SheCore, SheError, BLOCK_SIZE, KEY_SIZE, UID_SIZE};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const ZERO_IV: [u8; BLOCK_SIZE] = [0u8; BLOCK_SIZE];

impl<S: KeyStore> SheCore<S> {
    pub(crate) fn load_key(
        &mut self,
        m1: &[u8; M1_SIZE],
        m2: &[u8; M2_SIZE],
        m3: &[u8; M3_SIZE],
    ) -> Result<Reply, SheError> {
        let uid = self.uid.ok_or(SheError::SequenceError)?;

        let auth = self
            .store
            .read_key(self.key_id(codec::auth_id(m1)))
            .map_err(|_| SheError::KeyNotAvailable)?;

        // K2 authenticates M1 || M2 against M3.
        let k2 = Zeroizing::new(derive_key(&auth.key, &KEY_UPDATE_MAC_C));
        let mut mac = Cmac::<Aes128>::new(GenericArray::from_slice(&k2[..]));
        mac.update(m1);
        mac.update(m2);
        if mac.verify_slice(m3).is_err() {
            return Err(SheError::KeyUpdateError);
        }

        // K1 uncovers counter, flags and the new key material.
        let k1 = Zeroizing::new(derive_key(&auth.key, &KEY_UPDATE_ENC_C));
        let mut plain = Zeroizing::new(*m2);
        Aes128CbcDec::new(&(*k1).into(), &ZERO_IV.into())
            .decrypt_padded_mut::<NoPadding>(&mut plain[..])
            .map_err(|_| SheError::GeneralError)?;

        let new_count = codec::counter(&plain);
        let new_flags = codec::flags(&plain);
        let dest_slot = codec::key_id(m1);
        let dest_id = self.key_id(dest_slot);

        // The existing slot drives write-protect, replay and wildcard
        // policy; a missing slot skips the counter check.
        let existing = match self.store.read_key(dest_id) {
            Ok(entry) => Some(entry),
            Err(KeyStoreError::NotFound) => None,
            Err(KeyStoreError::Storage) => return Err(SheError::GeneralError),
        };
        if let Some(entry) = &existing {
            if entry.meta.flags & key_flag::WRITE_PROTECT != 0 {
                return Err(SheError::WriteProtected);
            }
            if new_count <= entry.meta.count {
                return Err(SheError::KeyUpdateError);
            }
        }
        let stored_flags = existing.as_ref().map(|e| e.meta.flags).unwrap_or(0);
        if m1[..UID_SIZE].iter().all(|&b| b == 0) {
            if stored_flags & key_flag::WILDCARD == 0 {
                return Err(SheError::KeyUpdateError);
            }
        } else if m1[..UID_SIZE] != uid {
            return Err(SheError::KeyUpdateError);
        }

        let mut new_key = Zeroizing::new([0u8; KEY_SIZE]);
        new_key.copy_from_slice(&plain[KEY_SIZE..]);
        let entry = KeyEntry {
            id: dest_id,
            meta: SlotMeta {
                flags: new_flags,
                count: new_count,
            },
            key: *new_key,
        };
        let stored_count = if dest_slot == slot::RAM_KEY {
            self.store
                .cache_key(entry)
                .map_err(|_| SheError::KeyUpdateError)?;
            self.ram_key_plain = true;
            new_count
        } else {
            self.store
                .add_object(entry)
                .map_err(|_| SheError::KeyUpdateError)?;
            // Read back to confirm the write took.
            let stored = self
                .store
                .read_key(dest_id)
                .map_err(|_| SheError::KeyUpdateError)?;
            stored.meta.count
        };

        // Confirmation under the installed key.
        let k3 = Zeroizing::new(derive_key(&new_key, &KEY_UPDATE_ENC_C));
        let mut m4 = [0u8; M4_SIZE];
        m4[..UID_SIZE].copy_from_slice(&uid);
        m4[UID_SIZE] = m1[M1_SIZE - 1];
        let mut tail = [0u8; BLOCK_SIZE];
        tail[..4].copy_from_slice(&codec::encode_counter_marked(stored_count));
        encrypt_block(&k3, &mut tail);
        m4[KEY_SIZE..].copy_from_slice(&tail);

        let k4 = Zeroizing::new(derive_key(&new_key, &KEY_UPDATE_MAC_C));
        let mut mac = Cmac::<Aes128>::new(GenericArray::from_slice(&k4[..]));
        mac.update(&m4);
        let m5 = mac.finalize().into_bytes().into();

        Ok(Reply::LoadKey { m4, m5 })
    }

    pub(crate) fn load_plain_key(&mut self, key: &[u8; KEY_SIZE]) -> Result<Reply, SheError> {
        let entry = KeyEntry {
            id: self.key_id(slot::RAM_KEY),
            meta: SlotMeta::default(),
            key: *key,
        };
        self.store
            .cache_key(entry)
            .map_err(|_| SheError::GeneralError)?;
        self.ram_key_plain = true;
        Ok(Reply::Done)
    }

    /// Wraps the current RAM key under the secret key so the client can
    /// reinstall it later through LOAD_KEY.
    pub(crate) fn export_ram_key(&mut self) -> Result<Reply, SheError> {
        if !self.ram_key_plain {
            return Err(SheError::KeyInvalid);
        }
        let uid = self.uid.ok_or(SheError::SequenceError)?;
        let secret = self.read_she_key(slot::SECRET_KEY)?;
        let ram = self.read_she_key(slot::RAM_KEY)?;

        let id_byte = (slot::RAM_KEY << 4) | slot::SECRET_KEY;
        let mut m1 = [0u8; M1_SIZE];
        m1[..UID_SIZE].copy_from_slice(&uid);
        m1[M1_SIZE - 1] = id_byte;

        // Cleartext M2: counter pinned to 1, no flags, RAM key in the
        // trailing block; encrypted in place under K1.
        let mut m2 = [0u8; M2_SIZE];
        m2[..4].copy_from_slice(&codec::encode_counter(1));
        m2[KEY_SIZE..].copy_from_slice(&ram.key);
        let k1 = Zeroizing::new(derive_key(&secret.key, &KEY_UPDATE_ENC_C));
        Aes128CbcEnc::new(&(*k1).into(), &ZERO_IV.into())
            .encrypt_padded_mut::<NoPadding>(&mut m2, M2_SIZE)
            .map_err(|_| SheError::GeneralError)?;

        let k2 = Zeroizing::new(derive_key(&secret.key, &KEY_UPDATE_MAC_C));
        let mut mac = Cmac::<Aes128>::new(GenericArray::from_slice(&k2[..]));
        mac.update(&m1);
        mac.update(&m2);
        let m3: [u8; M3_SIZE] = mac.finalize().into_bytes().into();

        let k3 = Zeroizing::new(derive_key(&ram.key, &KEY_UPDATE_ENC_C));
        let mut m4 = [0u8; M4_SIZE];
        m4[..UID_SIZE].copy_from_slice(&uid);
        m4[UID_SIZE] = id_byte;
        let mut tail = [0u8; BLOCK_SIZE];
        tail[..4].copy_from_slice(&codec::encode_counter_marked(1));
        encrypt_block(&k3, &mut tail);
        m4[KEY_SIZE..].copy_from_slice(&tail);

        let k4 = Zeroizing::new(derive_key(&ram.key, &KEY_UPDATE_MAC_C));
        let mut mac = Cmac::<Aes128>::new(GenericArray::from_slice(&k4[..]));
        mac.update(&m4);
        let m5 = mac.finalize().into_bytes().into();

        Ok(Reply::RamKeyExport(RamKeyExport { m1, m2, m3, m4, m5 }))
    }
}
