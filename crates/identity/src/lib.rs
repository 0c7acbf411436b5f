//! anonet identity
//!
//! Long-term node identity: a NIST P-256 key pair, its SHA-256 fingerprint,
//! deterministic derivation from a 12-word mnemonic, and on-disk key files.

mod keys;
mod keystore;
mod mnemonic;

pub use keys::{fingerprint_of_der, verify_signature, Identity, KeyError};
pub use keystore::{load_or_generate_identity, restore_identity, KeystoreError};
pub use mnemonic::{
    entropy_to_words, generate_mnemonic, seed_from_phrase, words_to_entropy, MnemonicError,
};
