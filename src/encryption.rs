//! Legacy QCOW encryption (method 1).
//!
//! Every 512-byte sector is encrypted with AES-128 in CBC mode. The IV is the
//! guest sector number, little-endian, zero-padded to 16 bytes. The key is the
//! user password copied into a zero-filled 16-byte buffer.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, KeyInit};
use aes::Aes128;

use crate::error::{QcowError, Result};

pub const KEY_SIZE: usize = 16;
pub const SECTOR_SIZE: usize = 512;
const BLOCK_SIZE: usize = 16;

/// Turns a password into key material.
///
/// Only US-ASCII is accepted. Passwords longer than 16 bytes are truncated.
pub fn key_from_password(password: &str) -> Result<[u8; KEY_SIZE]> {
    if !password.is_ascii() {
        return Err(QcowError::InvalidArgument(
            "password must be US-ASCII".into(),
        ));
    }
    let mut key = [0u8; KEY_SIZE];
    let bytes = password.as_bytes();
    let len = bytes.len().min(KEY_SIZE);
    key[..len].copy_from_slice(&bytes[..len]);
    Ok(key)
}

/// [`key_from_password`] for a UTF-16 encoded password.
pub fn key_from_utf16_password(password: &[u16]) -> Result<[u8; KEY_SIZE]> {
    let password = String::from_utf16(password).map_err(|_| {
        QcowError::InvalidArgument("password is not valid UTF-16".into())
    })?;
    key_from_password(&password)
}

/// Validates raw key material.
pub fn key_from_bytes(key: &[u8]) -> Result<[u8; KEY_SIZE]> {
    key.try_into().map_err(|_| {
        QcowError::InvalidArgument(format!(
            "unsupported key size: {} bytes, expected {}",
            key.len(),
            KEY_SIZE
        ))
    })
}

/// Decryption context bound to one open image.
pub struct SectorCipher {
    cipher: Aes128,
}

impl SectorCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        SectorCipher {
            cipher: Aes128::new(GenericArray::from_slice(key)),
        }
    }

    /// Decrypts `data` in place. `first_sector` is the guest sector number of
    /// the first byte of `data`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `data` is not a whole number of sectors.
    pub fn decrypt(&self, data: &mut [u8], first_sector: u64) -> Result<()> {
        if data.len() % SECTOR_SIZE != 0 {
            return Err(QcowError::InvalidArgument(format!(
                "encrypted data size {} is not a multiple of {}",
                data.len(),
                SECTOR_SIZE
            )));
        }
        for (i, sector) in data.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            let mut previous = [0u8; BLOCK_SIZE];
            previous[..8].copy_from_slice(&(first_sector + i as u64).to_le_bytes());

            for block in sector.chunks_exact_mut(BLOCK_SIZE) {
                let mut ciphertext = [0u8; BLOCK_SIZE];
                ciphertext.copy_from_slice(block);
                self.cipher
                    .decrypt_block(GenericArray::from_mut_slice(block));
                for (b, p) in block.iter_mut().zip(previous.iter()) {
                    *b ^= p;
                }
                previous = ciphertext;
            }
        }
        Ok(())
    }
}
