#![no_std]

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use zeroize::Zeroizing;

pub const BLOCK_SIZE: usize = 16;

/// Error kinds returned by the KDF.
#[derive(Debug, PartialEq, Eq)]
pub enum KdfError {
    /// The compression function is undefined for empty input.
    EmptyInput,
}

/// Miyaguchi-Preneel compression over the whole input, AES-128 as the
/// block cipher. A short trailing block is zero padded; no length
/// encoding is appended, so callers must feed fixed-width fields.
fn compress(input: &[u8]) -> [u8; BLOCK_SIZE] {
    let mut chain = Zeroizing::new([0u8; BLOCK_SIZE]);
    for block in input.chunks(BLOCK_SIZE) {
        let mut padded = Zeroizing::new([0u8; BLOCK_SIZE]);
        padded[..block.len()].copy_from_slice(block);

        let cipher = Aes128::new(GenericArray::from_slice(&chain[..]));
        let mut state = GenericArray::clone_from_slice(&padded[..]);
        cipher.encrypt_block(&mut state);

        for (i, out) in state.iter_mut().enumerate() {
            *out ^= padded[i] ^ chain[i];
        }
        chain.copy_from_slice(&state);
    }
    *chain
}

/// Computes a 16-byte digest of `input` with the Miyaguchi-Preneel
/// one-way compression function.
/// Returns [`KdfError::EmptyInput`] for a zero-length input.
pub fn aes_mp16(input: &[u8]) -> Result<[u8; BLOCK_SIZE], KdfError> {
    if input.is_empty() {
        return Err(KdfError::EmptyInput);
    }
    Ok(compress(input))
}

/// Derives a slot-specific key from a 16-byte key and one of the fixed
/// 16-byte SHE derivation constants, per the SHE KDF
/// (AES-MP16 over their concatenation).
pub fn derive_key(key: &[u8; BLOCK_SIZE], constant: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
    let mut input = Zeroizing::new([0u8; BLOCK_SIZE * 2]);
    input[..BLOCK_SIZE].copy_from_slice(key);
    input[BLOCK_SIZE..].copy_from_slice(constant);
    compress(&input[..])
}

#[cfg(test)]
mod tests {
    use super::*;

    // SHE key update constants, duplicated from the memory update
    // protocol description.
    const KEY_UPDATE_ENC_C: [u8; 16] = [
        0x01, 0x01, 0x53, 0x48, 0x45, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xB0,
    ];
    const KEY_UPDATE_MAC_C: [u8; 16] = [
        0x01, 0x02, 0x53, 0x48, 0x45, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0xB0,
    ];

    #[test]
    fn zero_block_matches_textbook_composition() {
        // H1 = AES(0, 0) ^ 0 ^ 0
        let expected = [
            0x66, 0xe9, 0x4b, 0xd4, 0xef, 0x8a, 0x2c, 0x3b, 0x88, 0x4c, 0xfa, 0x59, 0xca, 0x34,
            0x2b, 0x2e,
        ];
        assert_eq!(aes_mp16(&[0u8; 16]).unwrap(), expected);
    }

    #[test]
    fn short_input_is_zero_padded() {
        // A single zero byte pads out to the all-zero block.
        assert_eq!(aes_mp16(&[0u8; 1]).unwrap(), aes_mp16(&[0u8; 16]).unwrap());
        assert_eq!(aes_mp16(&[0u8; 15]).unwrap(), aes_mp16(&[0u8; 16]).unwrap());
    }

    #[test]
    fn empty_input_rejected() {
        assert_eq!(aes_mp16(&[]).unwrap_err(), KdfError::EmptyInput);
    }

    #[test]
    fn two_block_chaining() {
        let m1 = [0x11u8; 16];
        let m2 = [0x22u8; 16];

        let h1 = aes_mp16(&m1).unwrap();
        let cipher = Aes128::new(GenericArray::from_slice(&h1));
        let mut state = GenericArray::clone_from_slice(&m2);
        cipher.encrypt_block(&mut state);
        let mut expected = [0u8; 16];
        for i in 0..16 {
            expected[i] = state[i] ^ m2[i] ^ h1[i];
        }

        let mut input = [0u8; 32];
        input[..16].copy_from_slice(&m1);
        input[16..].copy_from_slice(&m2);
        assert_eq!(aes_mp16(&input).unwrap(), expected);
    }

    #[test]
    fn she_memory_update_derivation_vectors() {
        // K1/K2 from the SHE memory update protocol example.
        let auth_key = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f,
        ];
        let k1 = [
            0x11, 0x8a, 0x46, 0x44, 0x7a, 0x77, 0x0d, 0x87, 0x82, 0x8a, 0x69, 0xc2, 0x22, 0xe2,
            0xd1, 0x7e,
        ];
        let k2 = [
            0x2e, 0xbb, 0x2a, 0x3d, 0xa6, 0x2d, 0xbd, 0x64, 0xb1, 0x8b, 0xa6, 0x49, 0x3e, 0x9f,
            0xbe, 0x22,
        ];
        assert_eq!(derive_key(&auth_key, &KEY_UPDATE_ENC_C), k1);
        assert_eq!(derive_key(&auth_key, &KEY_UPDATE_MAC_C), k2);
    }
}
