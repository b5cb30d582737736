//! Signed audit receipts for contact reveals.

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::types::{ListingId, UserId};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReceiptCore {
    pub listing_id: ListingId,
    pub buyer_id: UserId,
    pub payment_reference: String,
    pub revealed_at_ms: u64,
    /// SHA-256 over the revealed contact JSON, so the receipt proves what was
    /// shown without repeating it.
    pub contact_digest: [u8; 32],
}

impl ReceiptCore {
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(b"uob-reveal-v1");
        hasher.update((self.listing_id.len() as u64).to_le_bytes());
        hasher.update(self.listing_id.as_bytes());
        hasher.update((self.buyer_id.len() as u64).to_le_bytes());
        hasher.update(self.buyer_id.as_bytes());
        hasher.update((self.payment_reference.len() as u64).to_le_bytes());
        hasher.update(self.payment_reference.as_bytes());
        hasher.update(self.revealed_at_ms.to_le_bytes());
        hasher.update(self.contact_digest);
        hasher.finalize().into()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevealReceipt {
    pub core: ReceiptCore,
    pub signer_id: String,
    #[serde(with = "crate::audit::serde_bytes")]
    pub signature: Vec<u8>,
}

impl RevealReceipt {
    pub fn digest(&self) -> [u8; 32] {
        self.core.digest()
    }
}

/// Platform key that signs reveal receipts.
#[derive(Clone)]
pub struct AuditSigner {
    signer_id: String,
    key: SigningKey,
}

impl std::fmt::Debug for AuditSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSigner")
            .field("signer_id", &self.signer_id)
            .finish_non_exhaustive()
    }
}

impl AuditSigner {
    pub fn new(signer_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            signer_id: signer_id.into(),
            key,
        }
    }

    pub fn from_secret_hex(signer_id: impl Into<String>, secret_hex: &str) -> Result<Self, AuditError> {
        let bytes = hex::decode(secret_hex.trim()).map_err(|_| AuditError::MalformedKey)?;
        let secret: [u8; 32] = bytes.try_into().map_err(|_| AuditError::MalformedKey)?;
        Ok(Self::new(signer_id, SigningKey::from_bytes(&secret)))
    }

    pub fn signer_id(&self) -> &str {
        &self.signer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn sign(&self, core: ReceiptCore) -> RevealReceipt {
        let signature = self.key.sign(&core.digest());
        RevealReceipt {
            core,
            signer_id: self.signer_id.clone(),
            signature: signature.to_bytes().to_vec(),
        }
    }
}

/// Known platform keys, by signer id.
#[derive(Clone, Debug, Default)]
pub struct AuditVerifier {
    keys: BTreeMap<String, VerifyingKey>,
}

impl AuditVerifier {
    pub fn new(keys: Vec<(String, VerifyingKey)>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    pub fn trusting(signer: &AuditSigner) -> Self {
        Self::new(vec![(signer.signer_id().to_string(), signer.verifying_key())])
    }

    pub fn verify(&self, receipt: &RevealReceipt) -> Result<(), AuditError> {
        let key = self
            .keys
            .get(&receipt.signer_id)
            .ok_or_else(|| AuditError::UnknownSigner(receipt.signer_id.clone()))?;
        let signature = Signature::from_slice(&receipt.signature)
            .map_err(|_| AuditError::MalformedSignature(receipt.signer_id.clone()))?;
        key.verify_strict(&receipt.digest(), &signature)
            .map_err(|_| AuditError::InvalidSignature(receipt.signer_id.clone()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("receipt signed by unknown key {0}")]
    UnknownSigner(String),
    #[error("malformed signature from {0}")]
    MalformedSignature(String),
    #[error("invalid signature from {0}")]
    InvalidSignature(String),
    #[error("audit key must be 32 bytes of hex")]
    MalformedKey,
}


pub(crate) mod serde_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        hex::decode(&encoded).map_err(D::Error::custom)
    }
}
