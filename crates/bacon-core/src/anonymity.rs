use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const SECRET_SIZE: usize = 32;

const ADJECTIVES: [&str; 16] = [
    "Crispy", "Smoky", "Maple", "Peppered", "Candied", "Savory", "Golden", "Sizzling",
    "Hickory", "Honeyed", "Toasted", "Glazed", "Spicy", "Tender", "Rustic", "Cured",
];

const ANIMALS: [&str; 16] = [
    "Boar", "Piglet", "Hog", "Sow", "Badger", "Otter", "Heron", "Falcon", "Lynx", "Marten",
    "Beaver", "Bison", "Moose", "Raven", "Fox", "Hare",
];

/// Public stand-in for a seller: same seller, same identity, every view.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnonymousIdentity {
    pub display_name: String,
    /// Hex seed for avatar generators.
    pub avatar_seed: String,
}

/// Derives [`AnonymousIdentity`] values with a keyed BLAKE3 hash.
///
/// Without the platform secret an outside viewer cannot map an identity back
/// to a seller id, even by enumerating ids.
#[derive(Clone)]
pub struct SellerAnonymizer {
    secret: Zeroizing<[u8; SECRET_SIZE]>,
}

impl std::fmt::Debug for SellerAnonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SellerAnonymizer").finish_non_exhaustive()
    }
}

impl SellerAnonymizer {
    pub fn generate() -> Self {
        let mut secret = Zeroizing::new([0u8; SECRET_SIZE]);
        OsRng.fill_bytes(&mut *secret);
        Self { secret }
    }

    pub fn from_bytes(bytes: [u8; SECRET_SIZE]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8; SECRET_SIZE] {
        &self.secret
    }

    pub fn identity_for(&self, internal_id: &str) -> AnonymousIdentity {
        let mut hasher = blake3::Hasher::new_keyed(&self.secret);
        hasher.update(b"uob-anon-v1");
        hasher.update(internal_id.as_bytes());
        let digest = hasher.finalize();
        let bytes = digest.as_bytes();

        let adjective = ADJECTIVES[(bytes[0] & 0x0f) as usize];
        let animal = ANIMALS[(bytes[1] & 0x0f) as usize];
        let number = u16::from_le_bytes([bytes[2], bytes[3]]) % 100;
        AnonymousIdentity {
            display_name: format!("{adjective} {animal} {number:02}"),
            avatar_seed: hex::encode(&bytes[4..20]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_per_seller() {
        let anonymizer = SellerAnonymizer::from_bytes([7u8; 32]);
        let a = anonymizer.identity_for("seller-1");
        let b = anonymizer.identity_for("seller-1");
        assert_eq!(a, b);
        assert_ne!(a.avatar_seed, anonymizer.identity_for("seller-2").avatar_seed);
    }

    #[test]
    fn identity_depends_on_platform_secret() {
        let a = SellerAnonymizer::from_bytes([1u8; 32]).identity_for("seller-1");
        let b = SellerAnonymizer::from_bytes([2u8; 32]).identity_for("seller-1");
        assert_ne!(a.avatar_seed, b.avatar_seed);
    }

    #[test]
    fn display_name_never_contains_the_id() {
        let anonymizer = SellerAnonymizer::generate();
        let identity = anonymizer.identity_for("kevin-bacon-42");
        assert!(!identity.display_name.to_lowercase().contains("kevin"));
        assert_eq!(identity.avatar_seed.len(), 32);
    }
}
