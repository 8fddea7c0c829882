//! Portable software AES-CTR backend (RustCrypto).

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use ctr::Ctr128BE;
use zeroize::Zeroizing;

use super::{BackendError, CtrBackend};
use crate::psk::KeySize;

/// Software AES-CTR cipher.
///
/// Holds the raw key bytes (wiped on drop) and builds the per-packet CTR
/// stream from them; each packet starts from its own IV, so no stream state
/// survives between transforms.
#[derive(Default)]
pub(crate) struct SoftwareAes {
    key: Option<InstalledKey>,
}

struct InstalledKey {
    bytes: Zeroizing<Vec<u8>>,
    size: KeySize,
}

impl CtrBackend for SoftwareAes {
    fn set_key(&mut self, key: &[u8], size: KeySize) -> Result<(), BackendError> {
        if key.len() != size.bytes() {
            return Err(BackendError::KeySetup(format!(
                "expected {} key bytes, got {}",
                size.bytes(),
                key.len()
            )));
        }
        self.key = Some(InstalledKey {
            bytes: Zeroizing::new(key.to_vec()),
            size,
        });
        Ok(())
    }

    fn xor_keystream(&mut self, iv: &[u8; 16], payload: &mut [u8]) -> Result<(), BackendError> {
        let key = self.key.as_ref().ok_or(BackendError::Unkeyed)?;
        match key.size {
            KeySize::Bits128 => apply::<Ctr128BE<Aes128>>(&key.bytes, iv, payload),
            KeySize::Bits192 => apply::<Ctr128BE<Aes192>>(&key.bytes, iv, payload),
            KeySize::Bits256 => apply::<Ctr128BE<Aes256>>(&key.bytes, iv, payload),
        }
    }
}

fn apply<C>(key: &[u8], iv: &[u8; 16], payload: &mut [u8]) -> Result<(), BackendError>
where
    C: KeyIvInit + StreamCipher,
{
    let mut cipher =
        C::new_from_slices(key, iv).map_err(|e| BackendError::KeySetup(e.to_string()))?;
    cipher
        .try_apply_keystream(payload)
        .map_err(|e| BackendError::Transform(e.to_string()))
}
