//! Passphrase-based session key derivation.
//!
//! Both peers derive the session AES key from the shared passphrase and the
//! session nonce carried in packet headers, so an in-band nonce exchange
//! stands in for a key exchange. The derivation must therefore be
//! deterministic everywhere: same passphrase, nonce, and key size always
//! yield the same key bytes, on every platform and under every cipher
//! backend.

use std::num::NonZeroU32;

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::psk::KeySize;

/// PBKDF2-HMAC-SHA256 iteration count.
///
/// Fixed by the protocol: peers that disagree on this value derive
/// different keys from the same passphrase and nonce.
pub const PBKDF2_ITERATIONS: u32 = 1024;

/// Derive AES key material from the passphrase and session nonce.
///
/// The salt is the nonce's 4-byte big-endian wire encoding. The returned
/// buffer holds exactly `size.bytes()` bytes and is wiped when dropped;
/// callers install it into the cipher backend and let it go out of scope.
pub(crate) fn derive_key(
    passphrase: &[u8],
    nonce: NonZeroU32,
    size: KeySize,
) -> Zeroizing<Vec<u8>> {
    let salt = nonce.get().to_be_bytes();
    let mut key = Zeroizing::new(vec![0u8; size.bytes()]);
    pbkdf2_hmac::<Sha256>(passphrase, &salt, PBKDF2_ITERATIONS, key.as_mut_slice());
    key
}
