//! Interchangeable AES-CTR cipher backends.
//!
//! Every backend satisfies the same contract: install a key, then XOR the
//! CTR keystream for a given 16-byte IV over a payload. The keystream is
//! bit-identical across backends — same IV layout, same key sizes, and a
//! block counter that increments big-endian over the whole block — so the
//! build-time choice never leaks into observable behavior and is not
//! exposed to callers.
//!
//! Which backend is compiled in is a cargo feature choice. When several
//! features are enabled, precedence is: TLS library, then kernel, then the
//! portable software implementation.

use thiserror::Error;

use crate::psk::KeySize;

mod software;

#[cfg(feature = "openssl-backend")]
mod tls;

#[cfg(all(feature = "linux-crypto", target_os = "linux"))]
mod kernel;

#[cfg(feature = "openssl-backend")]
pub(crate) use tls::TlsAes as ActiveBackend;

#[cfg(all(
    not(feature = "openssl-backend"),
    feature = "linux-crypto",
    target_os = "linux"
))]
pub(crate) use kernel::KernelAes as ActiveBackend;

#[cfg(not(any(
    feature = "openssl-backend",
    all(feature = "linux-crypto", target_os = "linux")
)))]
pub(crate) use software::SoftwareAes as ActiveBackend;

/// Errors from the cipher backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no key installed")]
    Unkeyed,

    #[error("key setup failed: {0}")]
    KeySetup(String),

    #[error("transform failed: {0}")]
    Transform(String),
}

/// Counter-mode AES with an installable key.
///
/// Implementations own their key schedule exclusively; contexts never share
/// backend state.
pub(crate) trait CtrBackend: Default {
    /// Install (or replace) the encryption key. `key` must hold exactly
    /// `size.bytes()` bytes.
    fn set_key(&mut self, key: &[u8], size: KeySize) -> Result<(), BackendError>;

    /// XOR the CTR keystream for `iv` over `payload` in place.
    ///
    /// Fails with [`BackendError::Unkeyed`] before the first `set_key`.
    fn xor_keystream(&mut self, iv: &[u8; 16], payload: &mut [u8]) -> Result<(), BackendError>;
}
