use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::ops::Reduce;
use p256::elliptic_curve::Field;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use p256::{FieldBytes, Scalar, U256};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid public key encoding")]
    InvalidPublicKey,
    #[error("Invalid secret key")]
    InvalidSecretKey,
    #[error("Seed too short: need at least 32 bytes")]
    SeedTooShort,
}

/// Long-term node identity: P-256 signing key pair plus its fingerprint.
///
/// Created once (randomly or from a mnemonic seed), loaded on start, never
/// mutated. The fingerprint is a pure function of the public key.
pub struct Identity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    fingerprint: String,
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            signing_key: self.signing_key.clone(),
            verifying_key: self.verifying_key,
            fingerprint: self.fingerprint.clone(),
        }
    }
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Derive the identity scalar from a 64-byte mnemonic seed.
    ///
    /// The first 32 bytes are reduced mod the P-256 group order; a zero
    /// result falls back to scalar 1 so derivation always succeeds.
    pub fn from_seed(seed: &[u8]) -> Result<Self, KeyError> {
        if seed.len() < 32 {
            return Err(KeyError::SeedTooShort);
        }

        let bytes = FieldBytes::clone_from_slice(&seed[..32]);
        let mut scalar = <Scalar as Reduce<U256>>::reduce_bytes(&bytes);
        if bool::from(scalar.is_zero()) {
            scalar = Scalar::ONE;
        }

        let signing_key = SigningKey::from_bytes(&scalar.to_bytes())
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Rebuild an identity from raw scalar bytes (keystore load path)
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, KeyError> {
        if secret.len() != 32 {
            return Err(KeyError::InvalidSecretKey);
        }
        let signing_key = SigningKey::from_bytes(FieldBytes::from_slice(secret))
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = *signing_key.verifying_key();
        let fingerprint = fingerprint_of(&verifying_key);
        Self {
            signing_key,
            verifying_key,
            fingerprint,
        }
    }

    /// The public key as X.509 SubjectPublicKeyInfo DER
    pub fn public_key_der(&self) -> Vec<u8> {
        self.verifying_key
            .to_public_key_der()
            .expect("P-256 SPKI encoding is infallible")
            .into_vec()
    }

    /// SHA-256 of the SPKI DER, lowercase hex (64 chars)
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// First 8 fingerprint chars, uppercase, for human disambiguation
    pub fn discriminator(&self) -> String {
        self.fingerprint[..8].to_uppercase()
    }

    /// Sign data with ECDSA/SHA-256, producing an ASN.1 DER signature
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing_key.sign(data);
        signature.to_der().as_bytes().to_vec()
    }

    /// Verify a DER signature against this identity's own key
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        match Signature::from_der(signature) {
            Ok(sig) => self.verifying_key.verify(data, &sig).is_ok(),
            Err(_) => false,
        }
    }

    /// Raw scalar bytes (for the keystore; handle with care)
    pub fn secret_bytes(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Compute the fingerprint of an SPKI DER public key
pub fn fingerprint_of_der(public_key_der: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key_der))
}

fn fingerprint_of(key: &VerifyingKey) -> String {
    let der = key
        .to_public_key_der()
        .expect("P-256 SPKI encoding is infallible");
    fingerprint_of_der(der.as_bytes())
}

/// Verify a DER signature under an SPKI DER public key.
///
/// Returns false on any decode failure; callers treat that as a bad
/// signature, not a distinct error.
pub fn verify_signature(public_key_der: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let verifying_key = match VerifyingKey::from_public_key_der(public_key_der) {
        Ok(vk) => vk,
        Err(_) => return false,
    };

    let signature = match Signature::from_der(signature) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    verifying_key.verify(data, &signature).is_ok()
}
