use bacon_core::payout::Cents;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use super::SellerContact;
use crate::audit::{AuditSigner, ReceiptCore, RevealReceipt};
use crate::error::ReferralError;
use crate::store::ChainStore;
use crate::types::{ListingId, UserId};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Authorized,
    Captured,
    Refunded,
}

/// What the payment collaborator reports for one purchase.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentConfirmation {
    pub listing_id: ListingId,
    pub buyer_id: UserId,
    pub payment_reference: String,
    pub state: PaymentState,
    pub amount: Cents,
}

impl PaymentConfirmation {
    pub fn is_captured(&self) -> bool {
        self.state == PaymentState::Captured
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevealedContact {
    pub contact: SellerContact,
    pub receipt: RevealReceipt,
}

/// Release a listing's seller contact to a buyer with a captured payment.
///
/// Each (listing, buyer) pair gets one reveal; the signed receipt is stored
/// before the contact is returned.
pub fn reveal_contact<S: ChainStore + ?Sized>(
    store: &S,
    signer: &AuditSigner,
    listing_id: &str,
    buyer_id: &str,
    payment: &PaymentConfirmation,
    now_ms: u64,
) -> Result<RevealedContact, ReferralError> {
    let listing = store
        .listing(listing_id)?
        .ok_or_else(|| ReferralError::ListingNotFound(listing_id.to_string()))?;
    if payment.listing_id != listing.id || payment.buyer_id != buyer_id {
        return Err(ReferralError::RevealDenied);
    }
    if !payment.is_captured() {
        return Err(ReferralError::PaymentNotCaptured);
    }

    let receipt = signer.sign(ReceiptCore {
        listing_id: listing.id.clone(),
        buyer_id: buyer_id.to_string(),
        payment_reference: payment.payment_reference.clone(),
        revealed_at_ms: now_ms,
        contact_digest: contact_digest(&listing.seller_contact),
    });
    store.record_reveal(receipt.clone()).map_err(|err| {
        if err.is_conflict() {
            ReferralError::AlreadyRevealed
        } else {
            ReferralError::Store(err)
        }
    })?;
    info!(listing_id, buyer_id, signer = receipt.signer_id.as_str(), "seller contact revealed");

    Ok(RevealedContact {
        contact: listing.seller_contact,
        receipt,
    })
}

fn contact_digest(contact: &SellerContact) -> [u8; 32] {
    fn field(hasher: &mut Sha256, value: &str) {
        hasher.update((value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }
    let mut hasher = Sha256::new();
    hasher.update(b"uob-seller-contact-v1");
    field(&mut hasher, &contact.name);
    for optional in [&contact.email, &contact.phone, &contact.address] {
        match optional {
            Some(value) => {
                hasher.update([1u8]);
                field(&mut hasher, value);
            }
            None => hasher.update([0u8]),
        }
    }
    for link in &contact.social_links {
        field(&mut hasher, link);
    }
    hasher.finalize().into()
}
