//! AES-CTR backend backed by the system TLS library (OpenSSL).

use openssl::symm::{Cipher, Crypter, Mode};
use zeroize::Zeroizing;

use super::{BackendError, CtrBackend};
use crate::psk::KeySize;

/// OpenSSL AES-CTR cipher.
///
/// A fresh `Crypter` is created per packet because every packet starts
/// from its own IV.
#[derive(Default)]
pub(crate) struct TlsAes {
    key: Option<InstalledKey>,
}

struct InstalledKey {
    bytes: Zeroizing<Vec<u8>>,
    cipher: Cipher,
}

impl CtrBackend for TlsAes {
    fn set_key(&mut self, key: &[u8], size: KeySize) -> Result<(), BackendError> {
        if key.len() != size.bytes() {
            return Err(BackendError::KeySetup(format!(
                "expected {} key bytes, got {}",
                size.bytes(),
                key.len()
            )));
        }
        let cipher = match size {
            KeySize::Bits128 => Cipher::aes_128_ctr(),
            KeySize::Bits192 => Cipher::aes_192_ctr(),
            KeySize::Bits256 => Cipher::aes_256_ctr(),
        };
        self.key = Some(InstalledKey {
            bytes: Zeroizing::new(key.to_vec()),
            cipher,
        });
        Ok(())
    }

    fn xor_keystream(&mut self, iv: &[u8; 16], payload: &mut [u8]) -> Result<(), BackendError> {
        let key = self.key.as_ref().ok_or(BackendError::Unkeyed)?;

        let mut crypter = Crypter::new(key.cipher, Mode::Encrypt, &key.bytes, Some(iv))
            .map_err(|e| BackendError::KeySetup(e.to_string()))?;

        // Crypter::update requires the output to leave room for one extra
        // block even though CTR emits exactly the input length.
        let mut out = vec![0u8; payload.len() + key.cipher.block_size()];
        let written = crypter
            .update(payload, &mut out)
            .map_err(|e| BackendError::Transform(e.to_string()))?;
        if written != payload.len() {
            return Err(BackendError::Transform(format!(
                "short transform: {written} of {} bytes",
                payload.len()
            )));
        }

        payload.copy_from_slice(&out[..written]);
        Ok(())
    }
}
