//! AES bulk operations addressed by key slot: ECB/CBC in both
//! directions, CMAC generation and verification.
//!
//! ECB/CBC payloads are truncated to a whole number of blocks before
//! processing; the reply carries the truncated length.

use aes::cipher::block_padding::NoPadding;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::keystore::KeyStore;
use crate::{Reply, SheCore, SheError, BLOCK_SIZE, KEY_SIZE};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Encrypts one block in place. Used for the M4 confirmation word and
/// the PRNG ratchet, where CBC with a zero IV degenerates to this.
pub(crate) fn encrypt_block(key: &[u8; KEY_SIZE], block: &mut [u8; BLOCK_SIZE]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

/// Truncates to a whole number of cipher blocks.
fn block_aligned(data: &[u8]) -> &[u8] {
    &data[..data.len() - data.len() % BLOCK_SIZE]
}

impl<S: KeyStore> SheCore<S> {
    pub(crate) fn enc_ecb(&mut self, key_id: u8, data: &[u8]) -> Result<Reply, SheError> {
        let entry = self.read_she_key(key_id)?;
        let cipher = Aes128::new(GenericArray::from_slice(&entry.key));
        let mut buf = block_aligned(data).to_vec();
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(Reply::Cipher(buf))
    }

    pub(crate) fn dec_ecb(&mut self, key_id: u8, data: &[u8]) -> Result<Reply, SheError> {
        let entry = self.read_she_key(key_id)?;
        let cipher = Aes128::new(GenericArray::from_slice(&entry.key));
        let mut buf = block_aligned(data).to_vec();
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(Reply::Cipher(buf))
    }

    pub(crate) fn enc_cbc(
        &mut self,
        key_id: u8,
        iv: &[u8; BLOCK_SIZE],
        data: &[u8],
    ) -> Result<Reply, SheError> {
        let entry = self.read_she_key(key_id)?;
        let mut buf = block_aligned(data).to_vec();
        let len = buf.len();
        Aes128CbcEnc::new(&entry.key.into(), iv.into())
            .encrypt_padded_mut::<NoPadding>(&mut buf, len)
            .map_err(|_| SheError::GeneralError)?;
        Ok(Reply::Cipher(buf))
    }

    pub(crate) fn dec_cbc(
        &mut self,
        key_id: u8,
        iv: &[u8; BLOCK_SIZE],
        data: &[u8],
    ) -> Result<Reply, SheError> {
        let entry = self.read_she_key(key_id)?;
        let mut buf = block_aligned(data).to_vec();
        Aes128CbcDec::new(&entry.key.into(), iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|_| SheError::GeneralError)?;
        Ok(Reply::Cipher(buf))
    }

    pub(crate) fn generate_mac(&mut self, key_id: u8, data: &[u8]) -> Result<Reply, SheError> {
        let entry = self.read_she_key(key_id)?;
        let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(&entry.key));
        mac.update(data);
        Ok(Reply::Mac(mac.finalize().into_bytes().into()))
    }

    /// Tag verification reports its verdict in the payload; a wrong tag
    /// is still a transport-level success.
    pub(crate) fn verify_mac(
        &mut self,
        key_id: u8,
        data: &[u8],
        tag: &[u8],
    ) -> Result<Reply, SheError> {
        let entry = self.read_she_key(key_id)?;
        if tag.is_empty() || tag.len() > BLOCK_SIZE {
            return Ok(Reply::MacVerdict(1));
        }
        let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(&entry.key));
        mac.update(data);
        let verdict = if mac.verify_truncated_left(tag).is_ok() { 0 } else { 1 };
        Ok(Reply::MacVerdict(verdict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use crate::testutil::MemStore;
    use crate::{slot, Command, KeyId, UID_SIZE};

    const CLIENT: u8 = 1;
    const UID: [u8; UID_SIZE] = [0x01; UID_SIZE];
    const KEY: [u8; KEY_SIZE] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    fn ready_core() -> SheCore<MemStore> {
        let store = MemStore::default().with_key(KeyId::she(CLIENT, slot::KEY_1), 0, 0, KEY);
        let mut core = SheCore::new(store, CLIENT);
        core.handle(Command::SetUid(&UID)).unwrap();
        assert_eq!(
            core.handle(Command::SecureBootInit(0)).unwrap_err(),
            SheError::NoSecureBoot
        );
        core
    }

    fn cipher_output(reply: Reply) -> Vec<u8> {
        match reply {
            Reply::Cipher(data) => data,
            reply => panic!("unexpected reply: {:?}", reply),
        }
    }

    #[test]
    fn ecb_single_block_matches_fips_vector() {
        // FIPS-197 appendix vector for AES-128.
        let plaintext = [
            0x32, 0x43, 0xf6, 0xa8, 0x88, 0x5a, 0x30, 0x8d, 0x31, 0x31, 0x98, 0xa2, 0xe0, 0x37,
            0x07, 0x34,
        ];
        let ciphertext = [
            0x39, 0x25, 0x84, 0x1d, 0x02, 0xdc, 0x09, 0xfb, 0xdc, 0x11, 0x85, 0x97, 0x19, 0x6a,
            0x0b, 0x32,
        ];

        let mut core = ready_core();
        let out = cipher_output(
            core.handle(Command::EncEcb {
                key_id: slot::KEY_1,
                data: &plaintext,
            })
            .unwrap(),
        );
        assert_eq!(out, ciphertext);
    }

    #[test]
    fn ecb_round_trip_with_truncation() {
        let mut data = [0u8; 40];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = i as u8;
        }

        let mut core = ready_core();
        let encrypted = cipher_output(
            core.handle(Command::EncEcb {
                key_id: slot::KEY_1,
                data: &data,
            })
            .unwrap(),
        );
        // The trailing partial block is dropped.
        assert_eq!(encrypted.len(), 32);

        let decrypted = cipher_output(
            core.handle(Command::DecEcb {
                key_id: slot::KEY_1,
                data: &encrypted,
            })
            .unwrap(),
        );
        assert_eq!(decrypted, &data[..32]);
    }

    #[test]
    fn cbc_round_trip_uses_request_iv() {
        let iv = [0xA5u8; BLOCK_SIZE];
        let data = [0x42u8; 48];

        let mut core = ready_core();
        let encrypted = cipher_output(
            core.handle(Command::EncCbc {
                key_id: slot::KEY_1,
                iv: &iv,
                data: &data,
            })
            .unwrap(),
        );
        assert_ne!(&encrypted[..], &data[..]);

        let decrypted = cipher_output(
            core.handle(Command::DecCbc {
                key_id: slot::KEY_1,
                iv: &iv,
                data: &encrypted,
            })
            .unwrap(),
        );
        assert_eq!(decrypted, data);

        // A different IV decrypts the first block differently.
        let other_iv = [0x5Au8; BLOCK_SIZE];
        let garbled = cipher_output(
            core.handle(Command::DecCbc {
                key_id: slot::KEY_1,
                iv: &other_iv,
                data: &encrypted,
            })
            .unwrap(),
        );
        assert_ne!(&garbled[..BLOCK_SIZE], &data[..BLOCK_SIZE]);
        assert_eq!(&garbled[BLOCK_SIZE..], &data[BLOCK_SIZE..]);
    }

    #[test]
    fn mac_generate_then_verify() {
        let message = b"bootloader chunk for mac";

        let mut core = ready_core();
        let tag = match core
            .handle(Command::GenerateMac {
                key_id: slot::KEY_1,
                data: message,
            })
            .unwrap()
        {
            Reply::Mac(tag) => tag,
            reply => panic!("unexpected reply: {:?}", reply),
        };

        assert_eq!(
            core.handle(Command::VerifyMac {
                key_id: slot::KEY_1,
                data: message,
                mac: &tag,
            })
            .unwrap(),
            Reply::MacVerdict(0)
        );

        // Truncated tags verify against their prefix.
        assert_eq!(
            core.handle(Command::VerifyMac {
                key_id: slot::KEY_1,
                data: message,
                mac: &tag[..8],
            })
            .unwrap(),
            Reply::MacVerdict(0)
        );

        let mut bad_tag = tag;
        bad_tag[3] ^= 0x80;
        assert_eq!(
            core.handle(Command::VerifyMac {
                key_id: slot::KEY_1,
                data: message,
                mac: &bad_tag,
            })
            .unwrap(),
            Reply::MacVerdict(1)
        );
    }

    #[test]
    fn missing_key_reports_key_not_available() {
        let mut core = ready_core();
        assert_eq!(
            core.handle(Command::EncEcb {
                key_id: slot::KEY_9,
                data: &[0u8; 16],
            })
            .unwrap_err(),
            SheError::KeyNotAvailable
        );
        assert_eq!(
            core.handle(Command::GenerateMac {
                key_id: slot::KEY_9,
                data: &[0u8; 16],
            })
            .unwrap_err(),
            SheError::KeyNotAvailable
        );
    }
}
