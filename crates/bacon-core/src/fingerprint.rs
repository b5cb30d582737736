use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// How long a fingerprint stays bound to a chain once locked.
pub const LOCK_DURATION_HOURS: u32 = 72;

/// Free-form contact details a referrer supplies for a prospective buyer.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
}

impl Contact {
    pub fn email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
            ..Self::default()
        }
    }

    pub fn phone(phone: impl Into<String>) -> Self {
        Self {
            phone: Some(phone.into()),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Hex encoded SHA-256 digest of one normalised contact component.
pub type ContactHash = String;

/// Comparable identity digest of a [`Contact`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fingerprint {
    /// Email digest when an email is present, otherwise the phone digest.
    pub primary_hash: ContactHash,
    /// Every digest that could be formed, in the order email, phone, name,
    /// email+name, phone+name.
    pub all_hashes: Vec<ContactHash>,
    pub lock_duration_hours: u32,
}

impl Fingerprint {
    /// True when the two fingerprints share at least one digest.
    pub fn overlaps(&self, other: &Fingerprint) -> bool {
        self.all_hashes
            .iter()
            .any(|hash| other.all_hashes.contains(hash))
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.all_hashes.iter().any(|h| h == hash)
    }
}

/// Lowercase and trim an email, dropping any `+tag` sub-address.
///
/// Dots in the local part are kept: only some providers ignore them.
pub fn normalize_email(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    let normalized = match lowered.split_once('@') {
        Some((local, domain)) => {
            let local = local.split('+').next().unwrap_or(local);
            format!("{local}@{domain}")
        }
        None => lowered,
    };
    Some(normalized)
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    (!digits.is_empty()).then_some(digits)
}

pub fn normalize_name(raw: &str) -> Option<String> {
    let joined = raw
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

fn digest(tag: &[u8], parts: &[&str]) -> ContactHash {
    let mut hasher = Sha256::new();
    hasher.update(b"uob-contact-v1");
    hasher.update(tag);
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint a contact. Fails when neither an email nor a phone remains
/// after normalisation: a chain cannot be locked to an empty identity.
pub fn fingerprint(contact: &Contact) -> Result<Fingerprint, CoreError> {
    let email = contact.email.as_deref().and_then(normalize_email);
    let phone = contact.phone.as_deref().and_then(normalize_phone);
    let name = contact.name.as_deref().and_then(normalize_name);

    let email_hash = email.as_deref().map(|e| digest(b"email:", &[e]));
    let phone_hash = phone.as_deref().map(|p| digest(b"phone:", &[p]));

    let primary_hash = email_hash
        .clone()
        .or_else(|| phone_hash.clone())
        .ok_or(CoreError::InvalidContact)?;

    let mut all_hashes = Vec::with_capacity(5);
    all_hashes.extend(email_hash);
    all_hashes.extend(phone_hash);
    if let Some(name) = name.as_deref() {
        all_hashes.push(digest(b"name:", &[name]));
        if let Some(email) = email.as_deref() {
            all_hashes.push(digest(b"email+name:", &[email, name]));
        }
        if let Some(phone) = phone.as_deref() {
            all_hashes.push(digest(b"phone+name:", &[phone, name]));
        }
    }

    Ok(Fingerprint {
        primary_hash,
        all_hashes,
        lock_duration_hours: LOCK_DURATION_HOURS,
    })
}
