//! # Cryptographic Primitives for Dropline
//!
//! Key material comes from [`crate::derivation`]; this module only seals and
//! opens payloads with it. Everything here is a thin wrapper around audited
//! implementations (`aes-gcm`, `base64`, `rand`).

pub mod encryption;

pub use encryption::{decrypt, encrypt, max_plaintext_len, Payload};
