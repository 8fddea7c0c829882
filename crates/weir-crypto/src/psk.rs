//! Per-peer pre-shared-key cipher state and rekey policy.
//!
//! Each peer session owns one [`PskContext`] per direction. The context
//! holds the configured passphrase, the current session nonce, usage
//! counters and the keyed cipher backend, and decides on every call
//! whether the key must be rederived before the payload is transformed.
//!
//! # Keying model
//!
//! The AES key is never transmitted. The encrypting side draws a random
//! non-zero 32-bit nonce, derives the key with PBKDF2 (see [`crate::kdf`])
//! and starts counting transforms. The decrypting side observes the nonce
//! in the packet header and rederives the same key from its own copy of
//! the passphrase. A wire nonce of zero marks unencrypted traffic.
//!
//! # Rekeying
//!
//! A derived key is abandoned when any of these trip:
//! - the reuse ceiling ([`KEY_REUSE_CEILING`]) would be crossed,
//! - the configured rotation limit is reached (encrypt side),
//! - the peer's nonce changes (decrypt side),
//! - the passphrase is replaced.

use std::fmt;
use std::num::NonZeroU32;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::{Zeroize, ZeroizeOnDrop};

use weir_core::ProtocolVersion;

use crate::backend::{ActiveBackend, BackendError, CtrBackend};
use crate::kdf;

/// Maximum number of CTR transforms permitted under one derived key.
///
/// Crossing it forces a rekey on the encrypt side and refuses further
/// decrypts until the peer rotates, bounding keystream reuse.
pub const KEY_REUSE_CEILING: u32 = 1 << 28;

/// Capacity of the per-context passphrase buffer, in bytes.
pub const PASSPHRASE_CAPACITY: usize = 128;

/// The CTR IV is one AES block.
const AES_BLOCK_SIZE: usize = 16;

/// Errors surfaced by the PSK payload cipher.
#[derive(Debug, Error)]
pub enum PskError {
    #[error("unsupported key size: {0} bits")]
    InvalidKeySize(u32),

    #[error("passphrase of {len} bytes exceeds the 128-byte capacity")]
    PassphraseTooLong { len: usize },

    #[error("passphrase must not be empty")]
    EmptyPassphrase,

    #[error("key usage ceiling reached; packet is undecryptable until the peer rotates")]
    Undecryptable,

    #[error("cipher key setup failed: {0}")]
    KeySetup(#[source] BackendError),

    #[error("cipher transform failed: {0}")]
    Cipher(#[source] BackendError),
}

/// Supported AES key lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum KeySize {
    Bits128,
    Bits192,
    Bits256,
}

impl KeySize {
    /// Key length in bits.
    pub const fn bits(self) -> u32 {
        match self {
            Self::Bits128 => 128,
            Self::Bits192 => 192,
            Self::Bits256 => 256,
        }
    }

    /// Key length in bytes.
    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }
}

impl Default for KeySize {
    fn default() -> Self {
        Self::Bits128
    }
}

impl TryFrom<u32> for KeySize {
    type Error = PskError;

    fn try_from(bits: u32) -> Result<Self, PskError> {
        match bits {
            128 => Ok(Self::Bits128),
            192 => Ok(Self::Bits192),
            256 => Ok(Self::Bits256),
            other => Err(PskError::InvalidKeySize(other)),
        }
    }
}

impl From<KeySize> for u32 {
    fn from(size: KeySize) -> u32 {
        size.bits()
    }
}

/// Result of a successful decrypt call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptOutcome {
    /// The payload was encrypted and has been transformed in place.
    Decrypted,
    /// The wire nonce was zero: the peer sends cleartext and the payload
    /// was left untouched.
    Passthrough,
}

/// Fixed-capacity secret passphrase storage.
///
/// Wiped on drop and redacted from `Debug` output.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct Passphrase {
    bytes: [u8; PASSPHRASE_CAPACITY],
    len: usize,
}

impl Passphrase {
    fn new(secret: &str) -> Result<Self, PskError> {
        let raw = secret.as_bytes();
        if raw.is_empty() {
            return Err(PskError::EmptyPassphrase);
        }
        if raw.len() > PASSPHRASE_CAPACITY {
            return Err(PskError::PassphraseTooLong { len: raw.len() });
        }
        let mut bytes = [0u8; PASSPHRASE_CAPACITY];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self {
            bytes,
            len: raw.len(),
        })
    }

    fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passphrase(<{} bytes>)", self.len)
    }
}

/// Declarative PSK settings, typically deserialized from a session config.
#[derive(Clone, Serialize, Deserialize)]
pub struct PskConfig {
    /// Shared secret both peers were provisioned with.
    pub passphrase: String,
    /// AES key length; 128 bits unless configured otherwise.
    #[serde(default)]
    pub key_size: KeySize,
    /// Rekey after this many packets; 0 leaves only the reuse ceiling.
    #[serde(default)]
    pub rotation_limit: u32,
}

impl PskConfig {
    /// Open a cipher context with these settings.
    pub fn build(&self) -> Result<PskContext, PskError> {
        PskContext::new(&self.passphrase, self.key_size, self.rotation_limit)
    }
}

impl fmt::Debug for PskConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskConfig")
            .field("passphrase", &"<redacted>")
            .field("key_size", &self.key_size)
            .field("rotation_limit", &self.rotation_limit)
            .finish()
    }
}

/// Mutable per-peer PSK cipher state.
///
/// Not internally synchronized: the transport drives one context per
/// direction, each strictly sequentially. Dropping the context wipes the
/// passphrase and releases the backend state.
pub struct PskContext {
    passphrase: Passphrase,
    key_size: KeySize,
    rotation_limit: u32,
    nonce: Option<NonZeroU32>,
    used_count: u32,
    bad_decrypt: bool,
    bad_decrypt_count: u32,
    backend: ActiveBackend,
}

impl PskContext {
    /// Create an unkeyed context.
    ///
    /// No key exists yet; the first encrypt call establishes the session
    /// nonce and derives one.
    pub fn new(
        passphrase: &str,
        key_size: KeySize,
        rotation_limit: u32,
    ) -> Result<Self, PskError> {
        Ok(Self {
            passphrase: Passphrase::new(passphrase)?,
            key_size,
            rotation_limit,
            nonce: None,
            used_count: 0,
            bad_decrypt: false,
            bad_decrypt_count: 0,
            backend: ActiveBackend::default(),
        })
    }

    /// Replace the passphrase and force an immediate rekey under a fresh
    /// nonce.
    ///
    /// This is the only operation that rekeys unconditionally. If the new
    /// passphrase is rejected, the previous passphrase and key stay in
    /// effect untouched.
    pub fn set_passphrase(&mut self, passphrase: &str) -> Result<(), PskError> {
        self.passphrase = Passphrase::new(passphrase)?;
        self.rekey(draw_nonce())
    }

    /// Copy the configuration into a fresh, unkeyed context.
    ///
    /// The clone shares the passphrase, key size and rotation limit but
    /// owns its own backend state and has no nonce; it derives its own key
    /// on first use. Keyed state is deliberately never shared, which is
    /// why this is not an `impl Clone`.
    pub fn clone_unkeyed(&self) -> Self {
        Self {
            passphrase: self.passphrase.clone(),
            key_size: self.key_size,
            rotation_limit: self.rotation_limit,
            nonce: None,
            used_count: 0,
            bad_decrypt: false,
            bad_decrypt_count: 0,
            backend: ActiveBackend::default(),
        }
    }

    /// Current session nonce as carried on the wire; zero while unkeyed.
    pub fn nonce_wire(&self) -> u32 {
        self.nonce.map_or(0, NonZeroU32::get)
    }

    /// Whether a key has been derived for this context.
    pub fn is_keyed(&self) -> bool {
        self.nonce.is_some()
    }

    /// Transforms performed under the current key.
    pub fn used_count(&self) -> u32 {
        self.used_count
    }

    /// Configured AES key size.
    pub fn key_size(&self) -> KeySize {
        self.key_size
    }

    /// Record that a decrypted payload failed downstream validation.
    ///
    /// Diagnostic only: the counters feed peer statistics and reset when
    /// the peer rotates its nonce.
    pub fn note_bad_decrypt(&mut self) {
        self.bad_decrypt = true;
        self.bad_decrypt_count = self.bad_decrypt_count.saturating_add(1);
    }

    /// Whether any bad decrypt was recorded since the last nonce rotation.
    pub fn had_bad_decrypt(&self) -> bool {
        self.bad_decrypt
    }

    /// Bad-decrypt events recorded since the last nonce rotation.
    pub fn bad_decrypt_count(&self) -> u32 {
        self.bad_decrypt_count
    }

    /// Encrypt `payload` in place for transmission under `seq`.
    ///
    /// Draws a fresh nonce and rederives the key when the context is
    /// unkeyed, when the reuse ceiling would be crossed, or when the
    /// configured rotation limit is reached. The transport must carry
    /// [`Self::nonce_wire`] in the packet header so the peer can follow;
    /// this layer never transmits the nonce itself.
    pub fn encrypt(
        &mut self,
        seq: u32,
        version: ProtocolVersion,
        payload: &mut [u8],
    ) -> Result<(), PskError> {
        if self.needs_fresh_key() {
            self.rekey(draw_nonce())?;
        }
        self.transform(seq, version, payload)
    }

    /// Decrypt `payload` in place, keyed by the nonce observed in the
    /// packet header.
    ///
    /// A wire nonce of zero marks unencrypted traffic: payload and context
    /// are left untouched and [`DecryptOutcome::Passthrough`] is returned.
    /// A nonce change rekeys before the transform. Once the reuse ceiling
    /// is exceeded packets are refused until the peer rotates, so an
    /// over-used keystream is never extended.
    pub fn decrypt(
        &mut self,
        wire_nonce: u32,
        seq: u32,
        version: ProtocolVersion,
        payload: &mut [u8],
    ) -> Result<DecryptOutcome, PskError> {
        let Some(nonce) = NonZeroU32::new(wire_nonce) else {
            return Ok(DecryptOutcome::Passthrough);
        };

        if self.nonce != Some(nonce) {
            self.rekey(nonce)?;
            self.bad_decrypt = false;
            self.bad_decrypt_count = 0;
        }

        if self.used_count > KEY_REUSE_CEILING {
            warn!(
                used = self.used_count,
                "refusing to decrypt under an exhausted key"
            );
            return Err(PskError::Undecryptable);
        }

        self.transform(seq, version, payload)?;
        Ok(DecryptOutcome::Decrypted)
    }

    /// Encrypt-side rekey predicate, re-evaluated on every call.
    fn needs_fresh_key(&self) -> bool {
        if self.nonce.is_none() {
            return true;
        }
        if self.used_count.saturating_add(1) > KEY_REUSE_CEILING {
            return true;
        }
        self.rotation_limit > 0 && self.used_count >= self.rotation_limit
    }

    /// Adopt `nonce`, derive the matching AES key and install it into the
    /// backend. Resets the usage counter as its final effect.
    fn rekey(&mut self, nonce: NonZeroU32) -> Result<(), PskError> {
        self.nonce = Some(nonce);
        let key = kdf::derive_key(self.passphrase.as_bytes(), nonce, self.key_size);
        self.backend
            .set_key(&key, self.key_size)
            .map_err(PskError::KeySetup)?;
        self.used_count = 0;
        debug!(
            nonce = nonce.get(),
            key_bits = self.key_size.bits(),
            "derived session key"
        );
        Ok(())
    }

    /// XOR the keystream for `seq` over `payload`. Counts against the
    /// current key whether or not the backend succeeds.
    fn transform(
        &mut self,
        seq: u32,
        version: ProtocolVersion,
        payload: &mut [u8],
    ) -> Result<(), PskError> {
        let iv = ctr_iv(seq, version);
        let result = self.backend.xor_keystream(&iv, payload);
        self.used_count = self.used_count.saturating_add(1);
        result.map_err(PskError::Cipher)
    }

    #[cfg(test)]
    fn force_used_count(&mut self, value: u32) {
        self.used_count = value;
    }
}

impl fmt::Debug for PskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PskContext")
            .field("passphrase", &self.passphrase)
            .field("key_size", &self.key_size)
            .field("rotation_limit", &self.rotation_limit)
            .field("nonce", &self.nonce)
            .field("used_count", &self.used_count)
            .field("bad_decrypt_count", &self.bad_decrypt_count)
            .finish()
    }
}

/// Build the per-packet CTR IV: a zeroed AES block with the big-endian
/// sequence number at the offset the header version mandates.
fn ctr_iv(seq: u32, version: ProtocolVersion) -> [u8; AES_BLOCK_SIZE] {
    let mut iv = [0u8; AES_BLOCK_SIZE];
    // Version 1 headers carry the counter at the front of the block; every
    // other version places it in the trailing word.
    let offset = match version {
        ProtocolVersion::V1 => 0,
        ProtocolVersion::V0 | ProtocolVersion::V2 => 12,
    };
    iv[offset..offset + 4].copy_from_slice(&seq.to_be_bytes());
    iv
}

/// Draw a uniformly random non-zero session nonce.
///
/// Zero is the on-wire marker for "no key", so a zero draw is resampled
/// rather than treated as an error.
fn draw_nonce() -> NonZeroU32 {
    loop {
        if let Some(nonce) = NonZeroU32::new(OsRng.next_u32()) {
            return nonce;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V2: ProtocolVersion = ProtocolVersion::V2;

    fn context() -> PskContext {
        PskContext::new("hunter2", KeySize::Bits128, 0).unwrap()
    }

    #[test]
    fn test_key_size_try_from() {
        assert_eq!(KeySize::try_from(128).unwrap(), KeySize::Bits128);
        assert_eq!(KeySize::try_from(192).unwrap(), KeySize::Bits192);
        assert_eq!(KeySize::try_from(256).unwrap(), KeySize::Bits256);
        assert!(matches!(
            KeySize::try_from(512),
            Err(PskError::InvalidKeySize(512))
        ));
    }

    #[test]
    fn test_iv_layout_per_version() {
        let seq = 0x01020304;

        let front = ctr_iv(seq, ProtocolVersion::V1);
        assert_eq!(front[..4], [1, 2, 3, 4]);
        assert_eq!(front[4..], [0; 12]);

        for version in [ProtocolVersion::V0, ProtocolVersion::V2] {
            let tail = ctr_iv(seq, version);
            assert_eq!(tail[..12], [0; 12]);
            assert_eq!(tail[12..], [1, 2, 3, 4]);
        }
    }

    #[test]
    fn test_new_context_is_unkeyed() {
        let ctx = context();
        assert!(!ctx.is_keyed());
        assert_eq!(ctx.nonce_wire(), 0);
        assert_eq!(ctx.used_count(), 0);
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(matches!(
            PskContext::new("", KeySize::Bits128, 0),
            Err(PskError::EmptyPassphrase)
        ));
    }

    #[test]
    fn test_passphrase_capacity_boundary() {
        let at_capacity = "x".repeat(PASSPHRASE_CAPACITY);
        let mut ctx = PskContext::new(&at_capacity, KeySize::Bits128, 0).unwrap();

        // At capacity: accepted, and set_passphrase rekeys immediately.
        ctx.set_passphrase(&at_capacity).unwrap();
        assert!(ctx.is_keyed());
        assert_ne!(ctx.nonce_wire(), 0);

        // One byte over: rejected with all prior state intact.
        let nonce_before = ctx.nonce_wire();
        let over = "x".repeat(PASSPHRASE_CAPACITY + 1);
        assert!(matches!(
            ctx.set_passphrase(&over),
            Err(PskError::PassphraseTooLong { len }) if len == PASSPHRASE_CAPACITY + 1
        ));
        assert_eq!(ctx.nonce_wire(), nonce_before);

        assert!(matches!(
            PskContext::new(&over, KeySize::Bits128, 0),
            Err(PskError::PassphraseTooLong { .. })
        ));
    }

    #[test]
    fn test_first_encrypt_establishes_nonce() {
        let mut ctx = context();
        let mut payload = *b"attack at dawn";
        ctx.encrypt(1, V2, &mut payload).unwrap();

        assert!(ctx.is_keyed());
        assert_ne!(ctx.nonce_wire(), 0);
        assert_eq!(ctx.used_count(), 1);
        assert_ne!(payload, *b"attack at dawn");
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let mut sender = context();
        let mut receiver = context();

        let plaintext = b"the quick brown fox jumps over the lazy dog";
        let mut payload = plaintext.to_vec();

        sender.encrypt(42, V2, &mut payload).unwrap();
        let outcome = receiver
            .decrypt(sender.nonce_wire(), 42, V2, &mut payload)
            .unwrap();

        assert_eq!(outcome, DecryptOutcome::Decrypted);
        assert_eq!(payload, plaintext);
    }

    #[test]
    fn test_zero_wire_nonce_is_passthrough() {
        let mut ctx = context();
        let mut payload = *b"cleartext";

        let outcome = ctx.decrypt(0, 7, V2, &mut payload).unwrap();

        assert_eq!(outcome, DecryptOutcome::Passthrough);
        assert_eq!(payload, *b"cleartext");
        assert!(!ctx.is_keyed());
        assert_eq!(ctx.used_count(), 0);
    }

    #[test]
    fn test_rotation_limit_changes_nonce() {
        let mut ctx = PskContext::new("hunter2", KeySize::Bits128, 3).unwrap();
        let mut payload = [0u8; 32];

        ctx.encrypt(0, V2, &mut payload).unwrap();
        let first_nonce = ctx.nonce_wire();
        ctx.encrypt(1, V2, &mut payload).unwrap();
        ctx.encrypt(2, V2, &mut payload).unwrap();
        assert_eq!(ctx.nonce_wire(), first_nonce);
        assert_eq!(ctx.used_count(), 3);

        // Usage reached the limit: the next encrypt rotates first.
        ctx.encrypt(3, V2, &mut payload).unwrap();
        assert_ne!(ctx.nonce_wire(), first_nonce);
        assert_eq!(ctx.used_count(), 1);
    }

    #[test]
    fn test_encrypt_rekeys_at_reuse_ceiling() {
        let mut ctx = context();
        let mut payload = [0u8; 16];
        ctx.encrypt(0, V2, &mut payload).unwrap();
        let first_nonce = ctx.nonce_wire();

        ctx.force_used_count(KEY_REUSE_CEILING);
        ctx.encrypt(1, V2, &mut payload).unwrap();

        assert_ne!(ctx.nonce_wire(), first_nonce);
        assert_eq!(ctx.used_count(), 1);
    }

    #[test]
    fn test_decrypt_refuses_exhausted_key() {
        let mut sender = context();
        let mut receiver = context();

        let mut payload = b"refused".to_vec();
        sender.encrypt(9, V2, &mut payload).unwrap();
        let nonce = sender.nonce_wire();

        // Key the receiver under the same nonce, then exhaust it.
        let mut warmup = payload.clone();
        receiver.decrypt(nonce, 9, V2, &mut warmup).unwrap();
        receiver.force_used_count(KEY_REUSE_CEILING + 1);

        let before = payload.clone();
        let result = receiver.decrypt(nonce, 9, V2, &mut payload);
        assert!(matches!(result, Err(PskError::Undecryptable)));
        assert_eq!(payload, before);

        // A nonce rotation by the peer clears the refusal.
        sender.set_passphrase("hunter2").unwrap();
        let mut fresh = b"refused".to_vec();
        sender.encrypt(10, V2, &mut fresh).unwrap();
        let outcome = receiver
            .decrypt(sender.nonce_wire(), 10, V2, &mut fresh)
            .unwrap();
        assert_eq!(outcome, DecryptOutcome::Decrypted);
        assert_eq!(fresh, b"refused");
    }

    #[test]
    fn test_nonce_change_resets_bad_decrypt_stats() {
        let mut sender = context();
        let mut receiver = context();

        let mut payload = [0u8; 8];
        sender.encrypt(0, V2, &mut payload).unwrap();
        receiver
            .decrypt(sender.nonce_wire(), 0, V2, &mut payload)
            .unwrap();

        receiver.note_bad_decrypt();
        receiver.note_bad_decrypt();
        assert!(receiver.had_bad_decrypt());
        assert_eq!(receiver.bad_decrypt_count(), 2);

        // Peer rotates; diagnostics start over.
        sender.set_passphrase("hunter2").unwrap();
        let mut next = [0u8; 8];
        sender.encrypt(1, V2, &mut next).unwrap();
        receiver
            .decrypt(sender.nonce_wire(), 1, V2, &mut next)
            .unwrap();
        assert!(!receiver.had_bad_decrypt());
        assert_eq!(receiver.bad_decrypt_count(), 0);
    }

    #[test]
    fn test_clone_unkeyed_is_independent() {
        let mut ctx = PskContext::new("hunter2", KeySize::Bits256, 5).unwrap();
        let mut payload = [0u8; 4];
        ctx.encrypt(0, V2, &mut payload).unwrap();

        let clone = ctx.clone_unkeyed();
        assert!(!clone.is_keyed());
        assert_eq!(clone.nonce_wire(), 0);
        assert_eq!(clone.used_count(), 0);
        assert_eq!(clone.key_size(), KeySize::Bits256);

        // The clone derives its own key and still interoperates, because
        // key material depends only on (passphrase, nonce, key size).
        let mut other = clone;
        let mut buf = b"shared config".to_vec();
        other.encrypt(3, V2, &mut buf).unwrap();
        let mut third = ctx.clone_unkeyed();
        third
            .decrypt(other.nonce_wire(), 3, V2, &mut buf)
            .unwrap();
        assert_eq!(buf, b"shared config");
    }

    #[test]
    fn test_config_defaults_and_redaction() {
        let config: PskConfig =
            serde_json::from_str(r#"{ "passphrase": "hunter2" }"#).unwrap();
        assert_eq!(config.key_size, KeySize::Bits128);
        assert_eq!(config.rotation_limit, 0);

        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));

        let ctx = config.build().unwrap();
        assert!(!ctx.is_keyed());
    }

    #[test]
    fn test_config_rejects_bad_key_size() {
        let result =
            serde_json::from_str::<PskConfig>(r#"{ "passphrase": "x", "key_size": 137 }"#);
        assert!(result.is_err());
    }
}
