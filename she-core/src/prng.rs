//! Deterministic PRNG: seeded from the persisted PRNG seed, ratcheted
//! by AES under keys derived from the secret key.
//!
//! The persisted seed advances on every INIT_RND and EXTEND_SEED, so a
//! reboot never replays an output sequence.

use she_kdf::aes_mp16;
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::encrypt_block;
use crate::constants::{PRNG_KEY_C, PRNG_SEED_KEY_C};
use crate::keystore::{KeyEntry, KeyId, KeyStore, SlotMeta};
use crate::secure_boot::sreg;
use crate::{SheError, KEY_SIZE};

pub struct PrngMgr {
    inited: bool,
    state: [u8; KEY_SIZE],
    key: [u8; KEY_SIZE],
}

impl Drop for PrngMgr {
    fn drop(&mut self) {
        self.state.zeroize();
        self.key.zeroize();
    }
}

impl PrngMgr {
    pub(crate) fn new() -> Self {
        PrngMgr {
            inited: false,
            state: [0u8; KEY_SIZE],
            key: [0u8; KEY_SIZE],
        }
    }

    /// One-shot initialization: ratchets the persisted seed under
    /// K_seed, persists it, and derives the output key. The seed write
    /// lands before any in-memory state changes, so a storage failure
    /// leaves the PRNG uninitialized.
    pub(crate) fn init<S: KeyStore>(
        &mut self,
        store: &mut S,
        secret_id: KeyId,
        seed_id: KeyId,
    ) -> Result<(), SheError> {
        if self.inited {
            return Err(SheError::SequenceError);
        }
        let secret = store
            .read_key(secret_id)
            .map_err(|_| SheError::KeyNotAvailable)?;

        let mut kdf_input = Zeroizing::new([0u8; KEY_SIZE * 2]);
        kdf_input[..KEY_SIZE].copy_from_slice(&secret.key);
        kdf_input[KEY_SIZE..].copy_from_slice(&PRNG_SEED_KEY_C);
        let seed_key = Zeroizing::new(
            aes_mp16(&kdf_input[..]).map_err(|_| SheError::GeneralError)?,
        );

        let prev = store
            .read_key(seed_id)
            .map_err(|_| SheError::KeyNotAvailable)?;
        // Single block under a zero IV, so plain ECB.
        let mut seed = prev.key;
        encrypt_block(&seed_key, &mut seed);

        store
            .add_object(KeyEntry {
                id: seed_id,
                meta: SlotMeta::default(),
                key: seed,
            })
            .map_err(|_| SheError::KeyUpdateError)?;

        self.state = seed;
        kdf_input[KEY_SIZE..].copy_from_slice(&PRNG_KEY_C);
        self.key = aes_mp16(&kdf_input[..]).map_err(|_| SheError::GeneralError)?;
        self.inited = true;
        seed.zeroize();
        Ok(())
    }

    /// Advances the state by one AES application and returns it.
    pub(crate) fn rnd(&mut self) -> Result<[u8; KEY_SIZE], SheError> {
        if !self.inited {
            return Err(SheError::RngSeed);
        }
        encrypt_block(&self.key, &mut self.state);
        Ok(self.state)
    }

    /// Folds caller entropy into both the working state and the
    /// persisted seed.
    pub(crate) fn extend_seed<S: KeyStore>(
        &mut self,
        store: &mut S,
        seed_id: KeyId,
        entropy: &[u8; KEY_SIZE],
    ) -> Result<(), SheError> {
        if !self.inited {
            return Err(SheError::RngSeed);
        }
        let mut kdf_input = Zeroizing::new([0u8; KEY_SIZE * 2]);
        kdf_input[..KEY_SIZE].copy_from_slice(&self.state);
        kdf_input[KEY_SIZE..].copy_from_slice(entropy);
        self.state = aes_mp16(&kdf_input[..]).map_err(|_| SheError::GeneralError)?;

        let seed = store
            .read_key(seed_id)
            .map_err(|_| SheError::KeyNotAvailable)?;
        kdf_input[..KEY_SIZE].copy_from_slice(&seed.key);
        let new_seed = aes_mp16(&kdf_input[..]).map_err(|_| SheError::GeneralError)?;
        store
            .add_object(KeyEntry {
                id: seed_id,
                meta: SlotMeta::default(),
                key: new_seed,
            })
            .map_err(|_| SheError::KeyUpdateError)?;
        Ok(())
    }

    pub fn sreg(&self) -> u8 {
        if self.inited {
            sreg::RND_INIT
        } else {
            0
        }
    }
}
