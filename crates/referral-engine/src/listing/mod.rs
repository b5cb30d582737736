//! Listings and the anonymity filter.
//!
//! [`PublicListing`] is the only listing shape that leaves the engine on the
//! general read path. It has no seller contact fields and can only be built
//! by [`sanitize`].

use std::collections::BTreeMap;

use bacon_core::anonymity::{AnonymousIdentity, SellerAnonymizer};
use bacon_core::payout::{Cents, RewardRate};
use bacon_core::MAX_DEGREES;
use serde::{Deserialize, Serialize};

use crate::types::{ListingId, UserId};

mod reveal;

pub use reveal::{reveal_contact, PaymentConfirmation, PaymentState, RevealedContact};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Removed,
    Flagged,
    Sold,
}

/// Seller contact details. Never part of a public payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SellerContact {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    #[serde(default)]
    pub social_links: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingImage {
    pub url: String,
    /// EXIF and similar tags as extracted at upload.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

/// A listing row as read from the backing database.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Listing {
    pub id: ListingId,
    pub seller_id: UserId,
    pub title: String,
    pub description: String,
    pub asking_price: Cents,
    pub reward: RewardRate,
    #[serde(default = "default_max_degrees")]
    pub max_degrees: u8,
    pub status: ListingStatus,
    #[serde(default)]
    pub images: Vec<ListingImage>,
    pub seller_contact: SellerContact,
}

fn default_max_degrees() -> u8 {
    MAX_DEGREES
}

impl Listing {
    pub fn new(
        id: impl Into<ListingId>,
        seller_id: impl Into<UserId>,
        title: impl Into<String>,
        asking_price: Cents,
        reward: RewardRate,
        seller_contact: SellerContact,
    ) -> Self {
        Self {
            id: id.into(),
            seller_id: seller_id.into(),
            title: title.into(),
            description: String::new(),
            asking_price,
            reward,
            max_degrees: MAX_DEGREES,
            status: ListingStatus::Active,
            images: Vec::new(),
            seller_contact,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ListingStatus::Active
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PublicImage {
    url: String,
}

impl PublicImage {
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Listing as shown to viewers who have not paid for it.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct PublicListing {
    id: ListingId,
    title: String,
    description: String,
    asking_price: Cents,
    reward: RewardRate,
    max_degrees: u8,
    status: ListingStatus,
    seller: AnonymousIdentity,
    images: Vec<PublicImage>,
}

impl PublicListing {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn asking_price(&self) -> Cents {
        self.asking_price
    }

    pub fn reward(&self) -> RewardRate {
        self.reward
    }

    pub fn max_degrees(&self) -> u8 {
        self.max_degrees
    }

    pub fn status(&self) -> ListingStatus {
        self.status
    }

    pub fn seller(&self) -> &AnonymousIdentity {
        &self.seller
    }

    pub fn images(&self) -> &[PublicImage] {
        &self.images
    }
}

/// Strip seller identity and image metadata from a listing.
pub fn sanitize(listing: &Listing, anonymizer: &SellerAnonymizer) -> PublicListing {
    PublicListing {
        id: listing.id.clone(),
        title: listing.title.clone(),
        description: listing.description.clone(),
        asking_price: listing.asking_price,
        reward: listing.reward,
        max_degrees: listing.max_degrees,
        status: listing.status,
        seller: anonymizer.identity_for(&listing.seller_id),
        images: listing
            .images
            .iter()
            .map(|image| PublicImage {
                url: strip_query(&image.url),
            })
            .collect(),
    }
}

// Signed storage URLs can carry uploader hints in their query string.
fn strip_query(url: &str) -> String {
    url.split(['?', '#']).next().unwrap_or(url).to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_listing() -> Listing {
        let mut listing = Listing::new(
            "lst-1",
            "seller-1",
            "Vintage bacon press",
            Cents::from_dollars(1_000),
            RewardRate::from_percent(20).unwrap(),
            SellerContact {
                name: "Kevin Bacon".into(),
                email: Some("kevin@bacon.example".into()),
                phone: Some("555-0100".into()),
                address: Some("6 Degrees Lane".into()),
                social_links: vec!["https://social.example/kevin".into()],
            },
        );
        listing.description = "Cast iron, lightly seasoned".into();
        listing.images.push(ListingImage {
            url: "https://cdn.example/press.jpg?uploader=kevin".into(),
            metadata: BTreeMap::from([
                ("GPSLatitude".to_string(), "40.7".to_string()),
                ("Artist".to_string(), "Kevin Bacon".to_string()),
            ]),
        });
        listing
    }

    #[test]
    fn public_payload_carries_no_seller_fields() {
        let anonymizer = SellerAnonymizer::from_bytes([9u8; 32]);
        let public = sanitize(&sample_listing(), &anonymizer);
        let json = serde_json::to_string(&public).unwrap();
        for leaked in ["Kevin", "kevin", "555-0100", "Degrees Lane", "GPSLatitude", "seller-1"] {
            assert!(!json.contains(leaked), "{leaked} leaked into {json}");
        }
        assert_eq!(public.images()[0].url(), "https://cdn.example/press.jpg");
    }

    #[test]
    fn same_seller_same_anonymous_identity() {
        let anonymizer = SellerAnonymizer::from_bytes([9u8; 32]);
        let mut other = sample_listing();
        other.id = "lst-2".into();
        let a = sanitize(&sample_listing(), &anonymizer);
        let b = sanitize(&other, &anonymizer);
        assert_eq!(a.seller(), b.seller());
        assert_eq!(a.max_degrees(), MAX_DEGREES);
    }
}
