//! On-disk identity persistence
//!
//! Private keys are stored as PKCS#8 PEM, public keys as X.509
//! SubjectPublicKeyInfo PEM, and the recovery phrase as plain text. These
//! are the contracts with the persistence collaborator; the core reads and
//! writes them and nothing else.

use std::path::Path;

use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p256::SecretKey;
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

use crate::keys::{Identity, KeyError};
use crate::mnemonic::{generate_mnemonic, seed_from_phrase, MnemonicError};

const PRIVATE_KEY_FILE: &str = "identity.key";
const PUBLIC_KEY_FILE: &str = "identity.pub";
const MNEMONIC_FILE: &str = "mnemonic.txt";

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key file: {0}")]
    InvalidKeyFile(String),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Mnemonic error: {0}")]
    Mnemonic(#[from] MnemonicError),
}

/// Load the identity from `data_dir`, generating and persisting a fresh one
/// (with its mnemonic) if none exists. Returns the identity and whether it
/// was newly created.
pub fn load_or_generate_identity(
    data_dir: &Path,
    wordlist: &[&str],
) -> Result<(Identity, bool), KeystoreError> {
    let key_path = data_dir.join(PRIVATE_KEY_FILE);
    if key_path.exists() {
        let identity = load_identity(data_dir)?;
        info!("Loaded identity {}", identity.discriminator());
        return Ok((identity, false));
    }

    let phrase = generate_mnemonic(wordlist)?;
    let seed = Zeroizing::new(seed_from_phrase(&phrase, ""));
    let identity = Identity::from_seed(seed.as_ref())?;

    save_identity(data_dir, &identity)?;
    std::fs::write(data_dir.join(MNEMONIC_FILE), format!("{phrase}\n"))?;

    info!("Generated new identity {}", identity.discriminator());
    Ok((identity, true))
}

/// Recreate the identity from a recovery phrase and persist it
pub fn restore_identity(
    data_dir: &Path,
    phrase: &str,
    passphrase: &str,
) -> Result<Identity, KeystoreError> {
    let seed = Zeroizing::new(seed_from_phrase(phrase, passphrase));
    let identity = Identity::from_seed(seed.as_ref())?;
    save_identity(data_dir, &identity)?;
    Ok(identity)
}

fn load_identity(data_dir: &Path) -> Result<Identity, KeystoreError> {
    let pem = std::fs::read_to_string(data_dir.join(PRIVATE_KEY_FILE))?;
    let secret = SecretKey::from_pkcs8_pem(&pem)
        .map_err(|e| KeystoreError::InvalidKeyFile(e.to_string()))?;
    Ok(Identity::from_secret_bytes(secret.to_bytes().as_slice())?)
}

fn save_identity(data_dir: &Path, identity: &Identity) -> Result<(), KeystoreError> {
    std::fs::create_dir_all(data_dir)?;

    let secret_bytes = Zeroizing::new(identity.secret_bytes());
    let secret = SecretKey::from_slice(&secret_bytes)
        .map_err(|e| KeystoreError::InvalidKeyFile(e.to_string()))?;
    let private_pem = secret
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| KeystoreError::InvalidKeyFile(e.to_string()))?;
    std::fs::write(data_dir.join(PRIVATE_KEY_FILE), private_pem.as_bytes())?;

    let public = secret.public_key();
    let public_pem = public
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| KeystoreError::InvalidKeyFile(e.to_string()))?;
    std::fs::write(data_dir.join(PUBLIC_KEY_FILE), public_pem)?;
    Ok(())
}
