//! Pre-shared-key payload encryption for WEIR.
//!
//! This crate provides:
//! - Per-peer cipher contexts with usage-bounded rekeying
//! - PBKDF2 derivation of session keys from a shared passphrase
//! - AES-CTR packet transforms keyed by the transport sequence number
//! - Interchangeable cipher backends selected at build time
//!
//! # Design
//!
//! No key material ever crosses the wire. Both peers hold the same
//! passphrase; the encrypting side draws a random session nonce and each
//! side derives the AES key from (passphrase, nonce) independently. The
//! packet sequence number seeds the CTR counter block, so any packet can
//! be decrypted in isolation regardless of loss or reordering — the same
//! property the transport's retransmission layer relies on.
//!
//! Encryption and decryption are the identical XOR transform (CTR is an
//! involution), so one [`PskContext`] method pair covers both directions.

#![cfg_attr(not(feature = "linux-crypto"), forbid(unsafe_code))]
#![cfg_attr(feature = "linux-crypto", deny(unsafe_code))]

pub mod backend;
pub mod kdf;
pub mod psk;

pub use backend::BackendError;
pub use psk::{
    DecryptOutcome, KeySize, PskConfig, PskContext, PskError, KEY_REUSE_CEILING,
    PASSPHRASE_CAPACITY,
};
