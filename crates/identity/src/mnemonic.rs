//! Mnemonic seed phrases
//!
//! 128 bits of entropy encode as 12 words of 11 bits each, the last 4 bits
//! being a SHA-256 checksum. The wordlist is a collaborator asset and is
//! passed in by the caller; derivation round-trips through any 2048-word
//! list.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use zeroize::Zeroize;

const ENTROPY_BYTES: usize = 16;
const WORD_COUNT: usize = 12;
const WORDLIST_SIZE: usize = 2048;
const PBKDF2_ROUNDS: u32 = 2048;
const SALT_PREFIX: &str = "anonet-identity";

#[derive(Error, Debug)]
pub enum MnemonicError {
    #[error("Wordlist must contain exactly {WORDLIST_SIZE} words, got {0}")]
    BadWordlist(usize),
    #[error("Expected {WORD_COUNT} words, got {0}")]
    BadWordCount(usize),
    #[error("Unknown word: {0}")]
    UnknownWord(String),
    #[error("Checksum mismatch")]
    ChecksumMismatch,
}

/// Encode 128 bits of entropy as 12 words
pub fn entropy_to_words(
    entropy: &[u8; ENTROPY_BYTES],
    wordlist: &[&str],
) -> Result<Vec<String>, MnemonicError> {
    if wordlist.len() != WORDLIST_SIZE {
        return Err(MnemonicError::BadWordlist(wordlist.len()));
    }

    // entropy || 4 checksum bits, read as 12 groups of 11 bits
    let checksum = Sha256::digest(entropy)[0] >> 4;
    let mut bits = Vec::with_capacity(ENTROPY_BYTES * 8 + 4);
    for byte in entropy {
        for i in (0..8).rev() {
            bits.push((byte >> i) & 1);
        }
    }
    for i in (0..4).rev() {
        bits.push((checksum >> i) & 1);
    }

    let words = bits
        .chunks(11)
        .map(|chunk| {
            let index = chunk.iter().fold(0usize, |acc, b| (acc << 1) | *b as usize);
            wordlist[index].to_string()
        })
        .collect();
    Ok(words)
}

/// Decode 12 words back to entropy, verifying the checksum
pub fn words_to_entropy(
    words: &[&str],
    wordlist: &[&str],
) -> Result<[u8; ENTROPY_BYTES], MnemonicError> {
    if wordlist.len() != WORDLIST_SIZE {
        return Err(MnemonicError::BadWordlist(wordlist.len()));
    }
    if words.len() != WORD_COUNT {
        return Err(MnemonicError::BadWordCount(words.len()));
    }

    let mut bits: Vec<u8> = Vec::with_capacity(WORD_COUNT * 11);
    for word in words {
        let index = wordlist
            .iter()
            .position(|w| w == word)
            .ok_or_else(|| MnemonicError::UnknownWord(word.to_string()))?;
        for i in (0..11).rev() {
            bits.push(((index >> i) & 1) as u8);
        }
    }

    let mut entropy = [0u8; ENTROPY_BYTES];
    for (i, chunk) in bits[..ENTROPY_BYTES * 8].chunks(8).enumerate() {
        entropy[i] = chunk.iter().fold(0u8, |acc, b| (acc << 1) | b);
    }

    let expected = Sha256::digest(entropy)[0] >> 4;
    let got = bits[ENTROPY_BYTES * 8..]
        .iter()
        .fold(0u8, |acc, b| (acc << 1) | b);
    if expected != got {
        return Err(MnemonicError::ChecksumMismatch);
    }

    Ok(entropy)
}

/// Generate a fresh 12-word phrase from OS entropy
pub fn generate_mnemonic(wordlist: &[&str]) -> Result<String, MnemonicError> {
    let mut entropy = [0u8; ENTROPY_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut entropy);
    let words = entropy_to_words(&entropy, wordlist)?;
    entropy.zeroize();
    Ok(words.join(" "))
}

/// Stretch a phrase into the 64-byte identity seed.
///
/// PBKDF2-HMAC-SHA512, 2048 rounds, salt `"anonet-identity" || passphrase`.
pub fn seed_from_phrase(phrase: &str, passphrase: &str) -> [u8; 64] {
    let salt = format!("{SALT_PREFIX}{passphrase}");
    let mut seed = [0u8; 64];
    pbkdf2_hmac::<Sha512>(phrase.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut seed);
    seed
}

#[cfg(test)]
pub(crate) fn test_wordlist() -> Vec<String> {
    // Deterministic synthetic 2048-word list; real deployments supply the
    // canonical one.
    (0..WORDLIST_SIZE).map(|i| format!("word{i:04}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wordlist_refs(list: &[String]) -> Vec<&str> {
        list.iter().map(|s| s.as_str()).collect()
    }

    #[test]
    fn test_entropy_roundtrip() {
        let list = test_wordlist();
        let wordlist = wordlist_refs(&list);

        let entropy = [0xA7u8; 16];
        let words = entropy_to_words(&entropy, &wordlist).unwrap();
        assert_eq!(words.len(), 12);

        let word_refs: Vec<&str> = words.iter().map(|s| s.as_str()).collect();
        let restored = words_to_entropy(&word_refs, &wordlist).unwrap();
        assert_eq!(restored, entropy);
    }

    #[test]
    fn test_checksum_detects_word_swap() {
        let list = test_wordlist();
        let wordlist = wordlist_refs(&list);

        let entropy = [0x3Cu8; 16];
        let mut words = entropy_to_words(&entropy, &wordlist).unwrap();
        // Replace the final word (which carries checksum bits) with a
        // different valid word.
        words[11] = if words[11] == "word0000" {
            "word0001".to_string()
        } else {
            "word0000".to_string()
        };

        let word_refs: Vec<&str> = words.iter().map(|s| s.as_str()).collect();
        let result = words_to_entropy(&word_refs, &wordlist);
        assert!(matches!(result, Err(MnemonicError::ChecksumMismatch)));
    }

    #[test]
    fn test_unknown_word_rejected() {
        let list = test_wordlist();
        let wordlist = wordlist_refs(&list);

        let words = vec!["nonsense"; 12];
        assert!(matches!(
            words_to_entropy(&words, &wordlist),
            Err(MnemonicError::UnknownWord(_))
        ));
    }

    #[test]
    fn test_wrong_word_count_rejected() {
        let list = test_wordlist();
        let wordlist = wordlist_refs(&list);

        let words = vec!["word0000"; 11];
        assert!(matches!(
            words_to_entropy(&words, &wordlist),
            Err(MnemonicError::BadWordCount(11))
        ));
    }

    #[test]
    fn test_short_wordlist_rejected() {
        let short = vec!["a", "b", "c"];
        assert!(matches!(
            entropy_to_words(&[0u8; 16], &short),
            Err(MnemonicError::BadWordlist(3))
        ));
    }

    #[test]
    fn test_generate_produces_valid_phrase() {
        let list = test_wordlist();
        let wordlist = wordlist_refs(&list);

        let phrase = generate_mnemonic(&wordlist).unwrap();
        let words: Vec<&str> = phrase.split(' ').collect();
        assert_eq!(words.len(), 12);
        words_to_entropy(&words, &wordlist).unwrap();
    }

    #[test]
    fn test_seed_is_deterministic() {
        let a = seed_from_phrase("alpha beta gamma", "");
        let b = seed_from_phrase("alpha beta gamma", "");
        assert_eq!(a, b);
    }

    #[test]
    fn test_passphrase_changes_seed() {
        let a = seed_from_phrase("alpha beta gamma", "");
        let b = seed_from_phrase("alpha beta gamma", "hunter2");
        assert_ne!(a, b);
    }

    #[test]
    fn test_phrase_changes_seed() {
        let a = seed_from_phrase("alpha beta gamma", "");
        let b = seed_from_phrase("alpha beta delta", "");
        assert_ne!(a, b);
    }
}
