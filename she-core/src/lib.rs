#![no_std]
//! SHE (Secure Hardware Extension) server core.
//!
//! Receives already-framed commands, runs them through the SHE state
//! gate and dispatches to the secure-boot, key-update, PRNG and bulk
//! cipher handlers. Key material lives behind the [`KeyStore`] seam.

extern crate alloc;

/// Submodule implementing the AES bulk operations.
mod cipher;
/// Submodule implementing the packed M1/M2 field codec.
pub mod codec;
/// Submodule implementing the authenticated key update protocol.
mod key_update;
/// Submodule containing the keystore adapter interface.
mod keystore;
/// Submodule implementing the seeded deterministic PRNG.
mod prng;
/// Submodule implementing the three-phase secure boot engine.
mod secure_boot;

use alloc::vec::Vec;

pub use keystore::{key_flag, slot, KeyEntry, KeyId, KeyStore, KeyStoreError, SlotMeta};
pub use secure_boot::{sreg, SizeEndianness};

use prng::PrngMgr;
use secure_boot::SecureBootMgr;

pub const UID_SIZE: usize = 15;
pub const KEY_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;

/// Success code written into the response header when a handler
/// completes without error.
pub const ERC_NO_ERROR: u8 = 0x00;

/// SHE key update constants (16 bytes each, normative).
pub mod constants {
    pub const KEY_UPDATE_ENC_C: [u8; 16] = [
        0x01, 0x01, 0x53, 0x48, 0x45, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xB0,
    ];
    pub const KEY_UPDATE_MAC_C: [u8; 16] = [
        0x01, 0x02, 0x53, 0x48, 0x45, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xB0,
    ];
    pub const PRNG_KEY_C: [u8; 16] = [
        0x01, 0x04, 0x53, 0x48, 0x45, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xB0,
    ];
    pub const PRNG_SEED_KEY_C: [u8; 16] = [
        0x01, 0x05, 0x53, 0x48, 0x45, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xB0,
    ];
}

/// SHE error enumeration. The set is closed; anything a backend or
/// primitive reports outside of it surfaces as [`SheError::GeneralError`]
/// at the dispatch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheError {
    /// Command out of order with respect to the UID latch, the secure
    /// boot sequence or a one-shot operation.
    SequenceError,
    /// A required key slot is empty or unreadable.
    KeyNotAvailable,
    /// The addressed key cannot be used for this operation.
    KeyInvalid,
    KeyEmpty,
    /// Secure boot was skipped because no boot MAC key is provisioned.
    NoSecureBoot,
    /// The target slot carries the write-protection flag.
    WriteProtected,
    /// Verification, policy or storage failure during a key update.
    KeyUpdateError,
    /// The PRNG has not been initialized.
    RngSeed,
    NoDebugging,
    Busy,
    MemoryFailure,
    GeneralError,
    /// Malformed transport arguments; never remapped.
    BadArgs,
}

impl SheError {
    /// Wire code written into the response header.
    pub fn code(self) -> u8 {
        match self {
            SheError::SequenceError => 0x01,
            SheError::KeyNotAvailable => 0x02,
            SheError::KeyInvalid => 0x03,
            SheError::KeyEmpty => 0x04,
            SheError::NoSecureBoot => 0x05,
            SheError::WriteProtected => 0x06,
            SheError::KeyUpdateError => 0x07,
            SheError::RngSeed => 0x08,
            SheError::NoDebugging => 0x09,
            SheError::Busy => 0x0A,
            SheError::MemoryFailure => 0x0B,
            SheError::GeneralError => 0x0C,
            SheError::BadArgs => 0xFF,
        }
    }
}

/// A decoded SHE command. Payload slices borrow from the request frame.
#[derive(Debug, Clone, Copy)]
pub enum Command<'a> {
    SetUid(&'a [u8; UID_SIZE]),
    SecureBootInit(u32),
    SecureBootUpdate(&'a [u8]),
    SecureBootFinish,
    GetStatus,
    LoadKey {
        m1: &'a [u8; codec::M1_SIZE],
        m2: &'a [u8; codec::M2_SIZE],
        m3: &'a [u8; codec::M3_SIZE],
    },
    LoadPlainKey(&'a [u8; KEY_SIZE]),
    ExportRamKey,
    InitRnd,
    Rnd,
    ExtendSeed(&'a [u8; KEY_SIZE]),
    EncEcb { key_id: u8, data: &'a [u8] },
    EncCbc { key_id: u8, iv: &'a [u8; BLOCK_SIZE], data: &'a [u8] },
    DecEcb { key_id: u8, data: &'a [u8] },
    DecCbc { key_id: u8, iv: &'a [u8; BLOCK_SIZE], data: &'a [u8] },
    GenerateMac { key_id: u8, data: &'a [u8] },
    VerifyMac { key_id: u8, data: &'a [u8], mac: &'a [u8] },
}

/// The M1..M5 tuple produced by EXPORT_RAM_KEY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamKeyExport {
    pub m1: [u8; codec::M1_SIZE],
    pub m2: [u8; codec::M2_SIZE],
    pub m3: [u8; codec::M3_SIZE],
    pub m4: [u8; codec::M4_SIZE],
    pub m5: [u8; codec::M5_SIZE],
}

/// Handler output for a successfully dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Command completed; no payload beyond the status code.
    Done,
    /// SREG bitfield from GET_STATUS.
    Status(u8),
    /// Key update confirmation tuple.
    LoadKey {
        m4: [u8; codec::M4_SIZE],
        m5: [u8; codec::M5_SIZE],
    },
    RamKeyExport(RamKeyExport),
    Random([u8; KEY_SIZE]),
    /// ECB/CBC output, truncated to whole blocks.
    Cipher(Vec<u8>),
    Mac([u8; BLOCK_SIZE]),
    /// 0 when the tag verified, 1 otherwise.
    MacVerdict(u8),
}

/// Per-client SHE context: UID latch, secure boot progress, PRNG state
/// and the keystore handle. One logical client at a time per instance.
pub struct SheCore<S: KeyStore> {
    store: S,
    client_id: u8,
    uid: Option<[u8; UID_SIZE]>,
    boot: SecureBootMgr,
    prng: PrngMgr,
    ram_key_plain: bool,
}

impl<S: KeyStore> SheCore<S> {
    pub fn new(store: S, client_id: u8) -> Self {
        Self::with_endianness(store, client_id, SizeEndianness::default())
    }

    /// Like [`SheCore::new`] but selects the byte order used when the
    /// declared bootloader size is folded into the boot CMAC.
    pub fn with_endianness(store: S, client_id: u8, size_endianness: SizeEndianness) -> Self {
        SheCore {
            store,
            client_id,
            uid: None,
            boot: SecureBootMgr::new(size_endianness),
            prng: PrngMgr::new(),
            ram_key_plain: false,
        }
    }

    /// Drops all per-session state. Keys, counters and the PRNG seed
    /// survive in the backing store.
    pub fn reset(&mut self) {
        self.uid = None;
        self.boot.reset();
        self.prng = PrngMgr::new();
        self.ram_key_plain = false;
    }

    /// Dispatches one command: sequencing gate, handler, and the boot
    /// state reset that allows a failed secure boot to be retried.
    pub fn handle(&mut self, cmd: Command<'_>) -> Result<Reply, SheError> {
        self.gate(&cmd)?;
        let boot_cmd = matches!(
            cmd,
            Command::SecureBootInit(_) | Command::SecureBootUpdate(_) | Command::SecureBootFinish
        );
        let result = self.route(cmd);
        if boot_cmd {
            if let Err(err) = &result {
                if *err != SheError::NoSecureBoot {
                    self.boot.reset();
                }
            }
        }
        result
    }

    /// Sequencing preconditions, checked before any handler runs:
    /// the UID latch, then the secure boot requirement for everything
    /// outside the boot sequence itself and GET_STATUS.
    fn gate(&self, cmd: &Command<'_>) -> Result<(), SheError> {
        if matches!(cmd, Command::SetUid(_)) {
            return match self.uid {
                None => Ok(()),
                Some(_) => Err(SheError::SequenceError),
            };
        }
        if self.uid.is_none() {
            return Err(SheError::SequenceError);
        }
        let exempt = matches!(
            cmd,
            Command::SecureBootInit(_)
                | Command::SecureBootUpdate(_)
                | Command::SecureBootFinish
                | Command::GetStatus
        );
        if !self.boot.booted() && !exempt {
            return Err(SheError::SequenceError);
        }
        Ok(())
    }

    fn route(&mut self, cmd: Command<'_>) -> Result<Reply, SheError> {
        match cmd {
            Command::SetUid(uid) => {
                self.uid = Some(*uid);
                Ok(Reply::Done)
            }
            Command::SecureBootInit(size) => {
                let key_id = self.key_id(slot::BOOT_MAC_KEY);
                self.boot.init(&self.store, key_id, size)?;
                Ok(Reply::Done)
            }
            Command::SecureBootUpdate(chunk) => {
                self.boot.update(chunk)?;
                Ok(Reply::Done)
            }
            Command::SecureBootFinish => {
                let mac_id = self.key_id(slot::BOOT_MAC);
                self.boot.finish(&self.store, mac_id)?;
                Ok(Reply::Done)
            }
            Command::GetStatus => Ok(Reply::Status(self.boot.sreg() | self.prng.sreg())),
            Command::LoadKey { m1, m2, m3 } => self.load_key(m1, m2, m3),
            Command::LoadPlainKey(key) => self.load_plain_key(key),
            Command::ExportRamKey => self.export_ram_key(),
            Command::InitRnd => {
                let secret_id = self.key_id(slot::SECRET_KEY);
                let seed_id = self.key_id(slot::PRNG_SEED);
                self.prng.init(&mut self.store, secret_id, seed_id)?;
                Ok(Reply::Done)
            }
            Command::Rnd => Ok(Reply::Random(self.prng.rnd()?)),
            Command::ExtendSeed(entropy) => {
                let seed_id = self.key_id(slot::PRNG_SEED);
                self.prng.extend_seed(&mut self.store, seed_id, entropy)?;
                Ok(Reply::Done)
            }
            Command::EncEcb { key_id, data } => self.enc_ecb(key_id, data),
            Command::EncCbc { key_id, iv, data } => self.enc_cbc(key_id, iv, data),
            Command::DecEcb { key_id, data } => self.dec_ecb(key_id, data),
            Command::DecCbc { key_id, iv, data } => self.dec_cbc(key_id, iv, data),
            Command::GenerateMac { key_id, data } => self.generate_mac(key_id, data),
            Command::VerifyMac { key_id, data, mac } => self.verify_mac(key_id, data, mac),
        }
    }

    /// Composite id of a SHE slot within this client's namespace.
    fn key_id(&self, slot_id: u8) -> KeyId {
        KeyId::she(self.client_id, slot_id)
    }

    /// Reads a key the SHE way: any failure to produce the slot is
    /// reported as KEY_NOT_AVAILABLE.
    fn read_she_key(&self, slot_id: u8) -> Result<KeyEntry, SheError> {
        self.store
            .read_key(self.key_id(slot_id))
            .map_err(|_| SheError::KeyNotAvailable)
    }
}
