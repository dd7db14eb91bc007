use std::fs;
use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ChainError, ChainResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKeypair {
    pub public_key: String,
    pub secret_key: String,
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

pub fn load_or_generate_keypair(path: &Path) -> ChainResult<Keypair> {
    if path.exists() {
        load_keypair(path)
    } else {
        let keypair = generate_keypair();
        save_keypair(path, &keypair)?;
        Ok(keypair)
    }
}

pub fn save_keypair(path: &Path, keypair: &Keypair) -> ChainResult<()> {
    let stored = StoredKeypair {
        public_key: hex::encode(keypair.public.to_bytes()),
        secret_key: hex::encode(keypair.secret.to_bytes()),
    };
    let encoded = toml::to_string_pretty(&stored)
        .map_err(|err| ChainError::Config(format!("failed to encode keypair: {err}")))?;
    fs::create_dir_all(path.parent().unwrap_or_else(|| Path::new(".")))?;
    fs::write(path, encoded)?;
    Ok(())
}

pub fn load_keypair(path: &Path) -> ChainResult<Keypair> {
    let raw = fs::read_to_string(path)?;
    let stored: StoredKeypair = toml::from_str(&raw)
        .map_err(|err| ChainError::Config(format!("failed to decode keypair: {err}")))?;
    let secret_bytes = hex::decode(stored.secret_key)
        .map_err(|err| ChainError::Config(format!("invalid secret key encoding: {err}")))?;
    let public_bytes = hex::decode(stored.public_key)
        .map_err(|err| ChainError::Config(format!("invalid public key encoding: {err}")))?;
    let secret = SecretKey::from_bytes(&secret_bytes)
        .map_err(|err| ChainError::Config(format!("invalid secret key bytes: {err}")))?;
    let public = PublicKey::from_bytes(&public_bytes)
        .map_err(|err| ChainError::Config(format!("invalid public key bytes: {err}")))?;
    Ok(Keypair { secret, public })
}

pub fn sign_message(keypair: &Keypair, message: &[u8]) -> Signature {
    keypair.sign(message)
}

pub fn public_key_to_base64(public_key: &PublicKey) -> String {
    BASE64.encode(public_key.to_bytes())
}

pub fn public_key_from_base64(data: &str) -> ChainResult<PublicKey> {
    let bytes = BASE64
        .decode(data)
        .map_err(|err| ChainError::Crypto(format!("invalid public key encoding: {err}")))?;
    PublicKey::from_bytes(&bytes)
        .map_err(|err| ChainError::Crypto(format!("invalid public key bytes: {err}")))
}

/// The signature algorithms a node can be configured to accept. `Empty`
/// accepts any signature and is meant for tests and private deployments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureScheme {
    Ed25519,
    Empty,
}

impl SignatureScheme {
    pub fn from_name(name: &str) -> ChainResult<Self> {
        match name {
            "ed25519" | "ed25519det" => Ok(SignatureScheme::Ed25519),
            "empty" => Ok(SignatureScheme::Empty),
            other => Err(ChainError::Config(format!("unknown signature algorithm: {other}"))),
        }
    }

    pub fn verify(&self, public_key_base64: &str, message: &[u8], signature: &[u8]) -> ChainResult<bool> {
        match self {
            SignatureScheme::Empty => Ok(true),
            SignatureScheme::Ed25519 => {
                // malformed keys or signatures do not verify; they are an
                // admission failure, not a node fault
                let Ok(public_key) = public_key_from_base64(public_key_base64) else {
                    return Ok(false);
                };
                let Ok(signature) = Signature::from_bytes(signature) else {
                    return Ok(false);
                };
                Ok(public_key.verify(message, &signature).is_ok())
            }
        }
    }

    pub fn sign(&self, keypair: &Keypair, message: &[u8]) -> Vec<u8> {
        match self {
            SignatureScheme::Empty => Vec::new(),
            SignatureScheme::Ed25519 => sign_message(keypair, message).to_bytes().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic_keypair() -> Keypair {
        let secret = SecretKey::from_bytes(&[7u8; 32]).expect("secret");
        let public = PublicKey::from(&secret);
        Keypair { secret, public }
    }

    #[test]
    fn ed25519_scheme_verifies_own_signatures() {
        let keypair = deterministic_keypair();
        let scheme = SignatureScheme::Ed25519;
        let message = b"request bytes";
        let signature = scheme.sign(&keypair, message);
        let encoded = public_key_to_base64(&keypair.public);
        assert!(scheme.verify(&encoded, message, &signature).unwrap());
        assert!(!scheme.verify(&encoded, b"other bytes", &signature).unwrap());
    }

    #[test]
    fn empty_scheme_accepts_anything() {
        assert!(SignatureScheme::Empty.verify("", b"whatever", &[]).unwrap());
    }

    #[test]
    fn sha256_is_stable() {
        assert_eq!(
            hex::encode(sha256(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
