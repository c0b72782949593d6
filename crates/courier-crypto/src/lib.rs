// Optional sign/verify and symmetric envelope for courier messages.
//
// The signature travels in the header as `ed25519:<keyhash>:<base64sig>`
// next to a base64 SHA-256 body digest, so a receiver can resolve the
// sender's verifying key from its key store without any global state.
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use courier_wire::Message;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hashbrown::HashMap;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

const SIGNATURE_SCHEME: &str = "ed25519";
const SYMMETRIC_TAG: &str = "sym:";
const NONCE_SIZE: usize = 12;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no verifying key for certificate hash {0}")]
    KeyNotFound(String),
    #[error("no symmetric key named {0}")]
    SymmetricKeyNotFound(String),
    #[error("malformed signature field")]
    MalformedSignature,
    #[error("body digest does not match header digest")]
    DigestMismatch,
    #[error("signature rejected")]
    SignatureRejected,
    #[error("envelope error: {0}")]
    Envelope(String),
    #[error("message is not encrypted")]
    NotEncrypted,
}

/// Key material injected into sign/verify and encrypt/decrypt.
///
/// Verifying keys are indexed by the base64 SHA-256 hash of their public
/// bytes, which is also the value published in `certificate_hash`.
pub struct KeyStore {
    signing: SigningKey,
    signing_hash: String,
    verifying: HashMap<String, VerifyingKey>,
    symmetric: HashMap<String, Key>,
}

impl KeyStore {
    pub fn new(signing: SigningKey) -> Self {
        let verifying_key = signing.verifying_key();
        let signing_hash = key_hash(&verifying_key);
        let mut verifying = HashMap::new();
        verifying.insert(signing_hash.clone(), verifying_key);
        Self {
            signing,
            signing_hash,
            verifying,
            symmetric: HashMap::new(),
        }
    }

    // Fresh random identity, mostly for tests and provisioning tools.
    pub fn generate() -> Self {
        Self::new(SigningKey::generate(&mut OsRng))
    }

    /// Hash under which this store's own signatures are published.
    pub fn signing_hash(&self) -> &str {
        &self.signing_hash
    }

    /// Register a peer's verifying key; returns its certificate hash.
    pub fn add_verifying_key(&mut self, key: VerifyingKey) -> String {
        let hash = key_hash(&key);
        self.verifying.insert(hash.clone(), key);
        hash
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn add_symmetric_key(&mut self, name: impl Into<String>, key: [u8; 32]) {
        self.symmetric.insert(name.into(), Key::from(key));
    }

    /// Digest the body and attach signature, digest and certificate hash.
    pub fn sign(&self, message: &mut Message) -> Result<()> {
        let digest = body_digest(&message.body);
        let signature = self.signing.sign(digest.as_bytes());
        message.header.digest = digest;
        message.header.signature = format!(
            "{SIGNATURE_SCHEME}:{}:{}",
            self.signing_hash,
            BASE64.encode(signature.to_bytes())
        );
        message.header.certificate_hash = self.signing_hash.clone();
        Ok(())
    }

    /// Check digest and signature, then strip both so the header re-encodes
    /// clean for forwarding.
    pub fn verify(&self, message: &mut Message) -> Result<()> {
        let mut parts = message.header.signature.splitn(3, ':');
        let scheme = parts.next().ok_or(Error::MalformedSignature)?;
        let hash = parts.next().ok_or(Error::MalformedSignature)?;
        let sig_b64 = parts.next().ok_or(Error::MalformedSignature)?;
        if scheme != SIGNATURE_SCHEME {
            return Err(Error::MalformedSignature);
        }
        if body_digest(&message.body) != message.header.digest {
            return Err(Error::DigestMismatch);
        }
        let key = self
            .verifying
            .get(hash)
            .ok_or_else(|| Error::KeyNotFound(hash.to_string()))?;
        let sig_bytes = BASE64
            .decode(sig_b64)
            .map_err(|_| Error::MalformedSignature)?;
        let signature =
            Signature::from_slice(&sig_bytes).map_err(|_| Error::MalformedSignature)?;
        key.verify(message.header.digest.as_bytes(), &signature)
            .map_err(|_| Error::SignatureRejected)?;
        message.header.signature.clear();
        message.header.digest.clear();
        Ok(())
    }

    /// Seal the body with a named symmetric key. The random nonce is
    /// prepended to the ciphertext before base64.
    pub fn encrypt(&self, message: &mut Message, key_name: &str) -> Result<()> {
        let key = self
            .symmetric
            .get(key_name)
            .ok_or_else(|| Error::SymmetricKeyNotFound(key_name.to_string()))?;
        let cipher = ChaCha20Poly1305::new(key);
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, message.body.as_bytes())
            .map_err(|err| Error::Envelope(err.to_string()))?;
        let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        message.body = BASE64.encode(payload);
        message.header.digest = format!("{SYMMETRIC_TAG}{key_name}");
        message.header.encrypted = true;
        Ok(())
    }

    pub fn decrypt(&self, message: &mut Message) -> Result<()> {
        if !message.header.encrypted {
            return Err(Error::NotEncrypted);
        }
        let key_name = message
            .header
            .digest
            .strip_prefix(SYMMETRIC_TAG)
            .ok_or_else(|| Error::Envelope("missing symmetric key tag".to_string()))?;
        let key = self
            .symmetric
            .get(key_name)
            .ok_or_else(|| Error::SymmetricKeyNotFound(key_name.to_string()))?;
        let payload = BASE64
            .decode(&message.body)
            .map_err(|err| Error::Envelope(err.to_string()))?;
        if payload.len() < NONCE_SIZE {
            return Err(Error::Envelope("payload shorter than nonce".to_string()));
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);
        let cipher = ChaCha20Poly1305::new(key);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|err| Error::Envelope(err.to_string()))?;
        message.body =
            String::from_utf8(plaintext).map_err(|err| Error::Envelope(err.to_string()))?;
        message.header.digest.clear();
        message.header.encrypted = false;
        Ok(())
    }
}

fn key_hash(key: &VerifyingKey) -> String {
    BASE64.encode(Sha256::digest(key.as_bytes()))
}

fn body_digest(body: &str) -> String {
    BASE64.encode(Sha256::digest(body.as_bytes()))
}
