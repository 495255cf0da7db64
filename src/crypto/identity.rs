//! Server signing identity loaded from PEM files.
//!
//! The private key is an Ed25519 key in PKCS#8 form. The optional certificate
//! file is a PEM chain handed to nodes verbatim during the handshake so they can
//! pin or validate it out of band.

use std::fs;
use std::path::Path;

use ed25519_dalek::pkcs8::DecodePrivateKey;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use rustls_pemfile::Item;

use super::CryptoError;

pub const SIGNATURE_LEN: usize = 64;

#[derive(Clone)]
pub struct ServerIdentity {
    signing: SigningKey,
    certificates: Vec<Vec<u8>>,
}

impl std::fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("verifying_key", &self.signing.verifying_key())
            .field("certificates", &self.certificates.len())
            .finish()
    }
}

impl ServerIdentity {
    pub fn new(signing: SigningKey, certificates: Vec<Vec<u8>>) -> Self {
        Self {
            signing,
            certificates,
        }
    }

    /// Fresh random identity without a certificate chain.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        OsRng.fill_bytes(&mut secret);
        Self::new(SigningKey::from_bytes(&secret), Vec::new())
    }

    pub fn load(key_path: &Path, cert_path: Option<&Path>) -> Result<Self, CryptoError> {
        let key_pem = fs::read(key_path)
            .map_err(|e| CryptoError::Identity(format!("{}: {}", key_path.display(), e)))?;
        let cert_pem = match cert_path {
            Some(path) => Some(
                fs::read(path)
                    .map_err(|e| CryptoError::Identity(format!("{}: {}", path.display(), e)))?,
            ),
            None => None,
        };
        Self::from_pem(&key_pem, cert_pem.as_deref())
    }

    pub fn from_pem(key_pem: &[u8], cert_pem: Option<&[u8]>) -> Result<Self, CryptoError> {
        let mut reader = key_pem;
        let signing = loop {
            match rustls_pemfile::read_one(&mut reader)
                .map_err(|e| CryptoError::Identity(e.to_string()))?
            {
                Some(Item::Pkcs8Key(key)) => {
                    break SigningKey::from_pkcs8_der(key.secret_pkcs8_der())
                        .map_err(|e| CryptoError::Identity(e.to_string()))?;
                }
                Some(_) => continue,
                None => {
                    return Err(CryptoError::Identity(
                        "no PKCS#8 private key in PEM input".into(),
                    ))
                }
            }
        };

        let certificates = match cert_pem {
            Some(pem) => {
                let mut reader = pem;
                rustls_pemfile::certs(&mut reader)
                    .map(|cert| cert.map(|der| der.as_ref().to_vec()))
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| CryptoError::Identity(e.to_string()))?
            }
            None => Vec::new(),
        };

        Ok(Self::new(signing, certificates))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing.sign(message).to_bytes()
    }
}

/// Checks an identity signature produced by [`ServerIdentity::sign`].
pub fn verify_signature(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    match Signature::from_slice(signature) {
        Ok(sig) => key.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}
