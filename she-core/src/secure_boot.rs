//! Three-phase secure boot: a streaming CMAC over the declared
//! bootloader image, checked against the stored expected digest.

use aes::cipher::generic_array::GenericArray;
use aes::Aes128;
use cmac::{Cmac, Mac};
use subtle::ConstantTimeEq;

use crate::keystore::{KeyId, KeyStore, KeyStoreError};
use crate::SheError;

/// SHE status register bits reported by GET_STATUS, at their SHE
/// positions. Only these four are ever produced.
pub mod sreg {
    /// A boot MAC key is provisioned.
    pub const SECURE_BOOT: u8 = 1 << 1;
    /// The boot sequence ran to a verdict.
    pub const BOOT_FINISHED: u8 = 1 << 3;
    /// The bootloader digest verified.
    pub const BOOT_OK: u8 = 1 << 4;
    pub const RND_INIT: u8 = 1 << 5;
}

/// Byte order used when folding the declared bootloader size into the
/// boot CMAC. SHE nominally asks for big-endian, but deployed servers
/// commonly hash the raw host-order word, so both are offered.
/// Little-endian is the interoperable default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeEndianness {
    #[default]
    Little,
    Big,
}

/// Boot sequence states. Advances INIT -> UPDATE -> FINISH and settles
/// in SUCCESS or FAILURE; anything out of order is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SbState {
    Init,
    Update,
    Finish,
    Success,
    Failure,
}

/// Zero prefix folded into the digest ahead of the size word.
const BOOT_MAC_PREFIX_LEN: usize = 12;

pub struct SecureBootMgr {
    state: SbState,
    bl_size: u32,
    bl_received: u32,
    cmac_key_found: bool,
    cmac: Option<Cmac<Aes128>>,
    size_endianness: SizeEndianness,
}

impl SecureBootMgr {
    pub(crate) fn new(size_endianness: SizeEndianness) -> Self {
        SecureBootMgr {
            state: SbState::Init,
            bl_size: 0,
            bl_received: 0,
            cmac_key_found: false,
            cmac: None,
            size_endianness,
        }
    }

    /// Starts the sequence over an image of `size` bytes. A missing
    /// boot MAC key skips straight to SUCCESS with
    /// [`SheError::NoSecureBoot`]; that is a policy outcome, not a
    /// failure, and must not reset the engine.
    pub(crate) fn init<S: KeyStore>(
        &mut self,
        store: &S,
        boot_mac_key_id: KeyId,
        size: u32,
    ) -> Result<(), SheError> {
        if self.state != SbState::Init {
            return Err(SheError::SequenceError);
        }
        self.bl_size = size;
        let entry = match store.read_key(boot_mac_key_id) {
            Ok(entry) => entry,
            Err(KeyStoreError::NotFound) => {
                self.state = SbState::Success;
                self.cmac_key_found = false;
                return Err(SheError::NoSecureBoot);
            }
            Err(KeyStoreError::Storage) => return Err(SheError::GeneralError),
        };
        self.cmac_key_found = true;

        let mut cmac = Cmac::<Aes128>::new(GenericArray::from_slice(&entry.key));
        cmac.update(&[0u8; BOOT_MAC_PREFIX_LEN]);
        let size_word = match self.size_endianness {
            SizeEndianness::Little => size.to_le_bytes(),
            SizeEndianness::Big => size.to_be_bytes(),
        };
        cmac.update(&size_word);
        self.cmac = Some(cmac);
        self.state = SbState::Update;
        Ok(())
    }

    /// Accumulates a bootloader chunk. Exceeding the declared size is a
    /// sequence error; reaching it exactly arms FINISH.
    pub(crate) fn update(&mut self, chunk: &[u8]) -> Result<(), SheError> {
        if self.state != SbState::Update {
            return Err(SheError::SequenceError);
        }
        self.bl_received = self.bl_received.saturating_add(chunk.len() as u32);
        if self.bl_received > self.bl_size {
            return Err(SheError::SequenceError);
        }
        let cmac = self.cmac.as_mut().ok_or(SheError::GeneralError)?;
        cmac.update(chunk);
        if self.bl_received == self.bl_size {
            self.state = SbState::Finish;
        }
        Ok(())
    }

    /// Finalizes the digest and compares it against the stored boot
    /// MAC in constant time.
    pub(crate) fn finish<S: KeyStore>(
        &mut self,
        store: &S,
        boot_mac_id: KeyId,
    ) -> Result<(), SheError> {
        if self.state != SbState::Finish {
            return Err(SheError::SequenceError);
        }
        let cmac = self.cmac.take().ok_or(SheError::GeneralError)?;
        let digest = cmac.finalize().into_bytes();
        let expected = store
            .read_key(boot_mac_id)
            .map_err(|_| SheError::KeyNotAvailable)?;
        if bool::from(digest.as_slice().ct_eq(&expected.key)) {
            self.state = SbState::Success;
            Ok(())
        } else {
            self.state = SbState::Failure;
            Err(SheError::GeneralError)
        }
    }

    /// Rewinds the engine so the client can retry the sequence.
    pub(crate) fn reset(&mut self) {
        self.state = SbState::Init;
        self.bl_size = 0;
        self.bl_received = 0;
        self.cmac_key_found = false;
        self.cmac = None;
    }

    /// Whether the gate may admit non-boot commands.
    pub fn booted(&self) -> bool {
        self.state == SbState::Success
    }

    pub fn sreg(&self) -> u8 {
        let mut bits = 0;
        if self.cmac_key_found {
            bits |= sreg::SECURE_BOOT;
        }
        if matches!(self.state, SbState::Success | SbState::Failure) {
            bits |= sreg::BOOT_FINISHED;
        }
        // A skipped boot settles in SUCCESS without a verified image,
        // so BOOT_OK additionally requires the key to have been there.
        if self.state == SbState::Success && self.cmac_key_found {
            bits |= sreg::BOOT_OK;
        }
        bits
    }
}
