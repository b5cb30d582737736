//! Chain Manager: the one place chains are created, extended, resolved and
//! completed.

use std::sync::Arc;

use bacon_core::anonymity::SellerAnonymizer;
use bacon_core::codes::{generate_chain_code, generate_tracking_code, is_tracking_code, ShareLink};
use bacon_core::fingerprint::{self, Contact, Fingerprint};
use bacon_core::payout::{self as split, Cents};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditSigner;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::ReferralError;
use crate::fraud::{FraudMonitor, RiskAction, RiskAssessment, RiskContext, RiskDecision};
use crate::listing::{
    reveal_contact, sanitize, Listing, PaymentConfirmation, PublicListing, RevealedContact,
};
use crate::payout::{self, BaconDistribution};
use crate::store::{
    ChainCreate, ChainStore, LinkAppend, LockInsert, NewChain, NewLink, SaleCommit,
};
use crate::types::{
    ActivityKind, ActivityRecord, Actor, ChainId, ChainStatus, ContactLock, ListingId,
    ReferralChain, ReferralLink, UserId,
};

/// A referrer sharing a listing, optionally naming the prospect and the
/// chain they arrived through.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareRequest {
    pub listing_id: ListingId,
    pub referrer: Actor,
    #[serde(default)]
    pub contact: Option<Contact>,
    /// Code of the chain the referrer clicked in on.
    #[serde(default)]
    pub parent_chain: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChainCondition {
    /// The referrer must verify identity before further chain actions.
    VerificationRequired,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChainResult {
    pub chain_id: ChainId,
    pub chain_code: String,
    pub referral_code: String,
    pub degree_position: u8,
    pub share_url: String,
    pub potential_bacon: Cents,
    pub created_chain: bool,
    #[serde(default)]
    pub conditions: Vec<ChainCondition>,
}

/// What a prospect sees after following a share link.
#[derive(Clone, Debug, Serialize)]
pub struct ChainContext {
    pub listing: PublicListing,
    pub referrer_degree: u8,
    pub referrer_display_name: String,
    /// Bacon for sharing onward; `None` once the chain is full.
    pub share_next_bacon: Option<Cents>,
    /// Pool paid across the chain if the viewer buys now.
    pub buy_now_payout: Cents,
    pub chain_status: ChainStatus,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SaleConfirmation {
    pub buyer: Actor,
    pub payment: PaymentConfirmation,
}

enum Target {
    Create,
    Extend(ReferralChain),
}

pub struct ChainManager<S: ChainStore + ?Sized> {
    store: Arc<S>,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    fraud: FraudMonitor,
    anonymizer: SellerAnonymizer,
}

impl<S: ChainStore + ?Sized> ChainManager<S> {
    pub fn new(
        store: Arc<S>,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        anonymizer: SellerAnonymizer,
    ) -> Self {
        let fraud = FraudMonitor::new(config.fraud.clone());
        Self {
            store,
            config,
            clock,
            fraud,
            anonymizer,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Attribute a share to the right chain, creating one when no live lock
    /// or open parent chain claims the prospect.
    pub fn create_or_extend_chain(&self, request: ShareRequest) -> Result<ChainResult, ReferralError> {
        let now = self.clock.now_ms();
        let listing = self.active_listing(&request.listing_id)?;
        let fingerprint = request
            .contact
            .as_ref()
            .map(|contact| self.fingerprint(contact))
            .transpose()?;
        let parent = match request.parent_chain.as_deref() {
            Some(code) => Some(self.chain_on_listing(code, &listing.id)?),
            None => None,
        };

        let locked = match &fingerprint {
            Some(fp) => self.live_lock(&listing.id, fp, now)?,
            None => None,
        };

        let target = match (locked, parent) {
            (Some((lock, chain)), Some(parent)) if parent.id != chain.id => {
                return Err(self.enforce_contact_locking(
                    &request.referrer,
                    &listing,
                    fingerprint.as_ref(),
                    &lock,
                    &chain,
                    now,
                ));
            }
            (Some((_, chain)), _) => Target::Extend(chain),
            (None, Some(parent)) if self.accepts_degrees(&parent, now) => Target::Extend(parent),
            (None, _) => Target::Create,
        };

        let action = match target {
            Target::Create => RiskAction::CreateChain,
            Target::Extend(_) => RiskAction::ExtendChain,
        };
        let assessment = self.assess(&request.referrer, action, &listing, fingerprint.as_ref(), now)?;
        let mut conditions = Vec::new();
        if assessment.decision == RiskDecision::RequireVerification {
            conditions.push(ChainCondition::VerificationRequired);
        }

        let referrer_id = &request.referrer.user_id;
        let (chain, link, created_chain) = match target {
            Target::Extend(chain) => {
                let link = self.append_to(&chain, referrer_id, &listing, now)?;
                if let Some(fp) = &fingerprint {
                    self.claim_for(&chain, fp, now)?;
                }
                (chain, link, false)
            }
            Target::Create => self.create_chain(&listing, referrer_id, fingerprint.as_ref(), now)?,
        };

        self.store.record_activity(ActivityRecord {
            user_id: referrer_id.clone(),
            kind: ActivityKind::Share,
            listing_id: listing.id.clone(),
            at_ms: now,
        })?;

        let share_url = ShareLink::Course {
            listing_id: listing.id.clone(),
            chain_code: chain.code.clone(),
            referral_code: link.referral_code.clone(),
        }
        .render(&self.config.base_url);
        info!(
            chain_id = %chain.id,
            listing_id = %listing.id,
            degree = link.degree,
            created_chain,
            "share attributed"
        );

        Ok(ChainResult {
            chain_id: chain.id,
            chain_code: chain.code,
            referral_code: link.referral_code,
            degree_position: link.degree,
            share_url,
            potential_bacon: split::potential_bacon(listing.asking_price, listing.reward, link.degree)
                .unwrap_or(Cents::ZERO),
            created_chain,
            conditions,
        })
    }

    /// Add `referrer_id` at the next free degree of a chain. A referrer
    /// already in the chain gets their existing link back.
    pub fn append_degree(&self, chain_id: ChainId, referrer_id: &str) -> Result<ReferralLink, ReferralError> {
        let now = self.clock.now_ms();
        let chain = self.store.chain(chain_id)?.ok_or(ReferralError::ChainNotFound)?;
        let listing = self.active_listing(&chain.listing_id)?;
        self.append_to(&chain, referrer_id, &listing, now)
    }

    /// Resolve a followed share link into what the prospect may see.
    pub fn resolve_click(&self, chain_code: &str, referral_code: &str) -> Result<ChainContext, ReferralError> {
        let now = self.clock.now_ms();
        if !is_tracking_code(referral_code) {
            return Err(ReferralError::ChainNotFound);
        }
        let chain = self
            .store
            .chain_by_code(chain_code)?
            .ok_or(ReferralError::ChainNotFound)?;
        let status = self.effective_status(&chain, now);
        if status.is_terminal() {
            return Err(ReferralError::ChainNotFound);
        }
        let link = self
            .store
            .link_by_code(chain.id, referral_code)?
            .ok_or(ReferralError::ChainNotFound)?;
        let listing = self
            .store
            .listing(&chain.listing_id)?
            .ok_or(ReferralError::ChainNotFound)?;

        let occupied = self.store.links(chain.id)?.len();
        let next_degree = occupied as u8 + 1;
        let share_next_bacon = (next_degree <= self.max_degrees(&listing))
            .then(|| split::potential_bacon(listing.asking_price, listing.reward, next_degree))
            .flatten();

        Ok(ChainContext {
            listing: sanitize(&listing, &self.anonymizer),
            referrer_degree: link.degree,
            referrer_display_name: self.anonymizer.identity_for(&link.referrer_id).display_name,
            share_next_bacon,
            buy_now_payout: split::pool(listing.asking_price, listing.reward),
            chain_status: status,
        })
    }

    /// Pay out a captured sale across the chain and close it. The listing,
    /// chain and distribution are settled in one store transaction, so a
    /// listing pays out at most once.
    pub fn complete_sale(
        &self,
        chain_code: &str,
        sale: SaleConfirmation,
    ) -> Result<BaconDistribution, ReferralError> {
        let now = self.clock.now_ms();
        if !sale.payment.is_captured() {
            return Err(ReferralError::PaymentNotCaptured);
        }
        let chain = self
            .store
            .chain_by_code(chain_code)?
            .ok_or(ReferralError::ChainNotFound)?;
        if sale.payment.listing_id != chain.listing_id || sale.payment.buyer_id != sale.buyer.user_id {
            return Err(ReferralError::PaymentMismatch);
        }
        let status = self.effective_status(&chain, now);
        if status.is_terminal() {
            return Err(ReferralError::ChainClosed { status });
        }
        let listing = self.active_listing(&chain.listing_id)?;

        self.assess(&sale.buyer, RiskAction::Purchase, &listing, None, now)?;

        let mut retried = false;
        let (completed, distribution) = loop {
            let links = self.store.links(chain.id)?;
            let distribution = payout::distribute(
                chain.id,
                &listing.id,
                sale.payment.amount,
                listing.reward,
                &links,
                now,
            )?;
            match self.store.complete_chain(distribution.clone()) {
                Ok(SaleCommit::Committed(completed)) => break (completed, distribution),
                Ok(SaleCommit::ChainClosed(status)) => return Err(ReferralError::ChainClosed { status }),
                Ok(SaleCommit::ListingUnavailable(status)) => {
                    warn!(listing_id = %listing.id, ?status, "sale on a listing that is no longer active");
                    return Err(ReferralError::ListingUnavailable(listing.id.clone()));
                }
                // A degree landed after the links were read.
                Err(err) if err.is_conflict() && !retried => {
                    retried = true;
                    debug!(chain_id = %chain.id, "chain changed during sale, recomputing");
                }
                Err(err) => return Err(err.into()),
            }
        };
        self.store.record_activity(ActivityRecord {
            user_id: sale.buyer.user_id.clone(),
            kind: ActivityKind::Purchase,
            listing_id: listing.id.clone(),
            at_ms: now,
        })?;

        info!(
            chain_id = %completed.id,
            listing_id = %listing.id,
            sale_price = %distribution.sale_price,
            pool = %distribution.pool,
            overflow = %distribution.unallocated,
            "sale completed"
        );
        Ok(distribution)
    }

    /// Preview of the bacon a degree would earn at the listing's asking
    /// price. `None` for degrees the listing does not pay.
    pub fn potential_bacon(&self, listing_id: &str, degree: u8) -> Result<Option<Cents>, ReferralError> {
        let listing = self
            .store
            .listing(listing_id)?
            .ok_or_else(|| ReferralError::ListingNotFound(listing_id.to_string()))?;
        if degree > self.max_degrees(&listing) {
            return Ok(None);
        }
        Ok(split::potential_bacon(listing.asking_price, listing.reward, degree))
    }

    /// Persist an expiry the chain already reads as. Returns the stored status.
    pub fn expire_if_stale(&self, chain_id: ChainId) -> Result<ChainStatus, ReferralError> {
        let now = self.clock.now_ms();
        let chain = self.store.chain(chain_id)?.ok_or(ReferralError::ChainNotFound)?;
        if chain.status.is_terminal() || self.effective_status(&chain, now) != ChainStatus::Expired {
            return Ok(chain.status);
        }
        match self.store.transition_chain(chain.id, chain.status, ChainStatus::Expired) {
            Ok(expired) => {
                info!(chain_id = %expired.id, "chain expired");
                Ok(expired.status)
            }
            Err(err) if err.is_conflict() => Ok(self
                .store
                .chain(chain_id)?
                .map(|c| c.status)
                .unwrap_or(ChainStatus::Expired)),
            Err(err) => Err(err.into()),
        }
    }

    /// Expire every stale chain on a listing, returning the ones changed.
    pub fn expire_stale_chains(&self, listing_id: &str) -> Result<Vec<ChainId>, ReferralError> {
        let mut expired = Vec::new();
        for chain in self.store.chains_for_listing(listing_id)? {
            if chain.status.is_terminal() {
                continue;
            }
            if self.expire_if_stale(chain.id)? == ChainStatus::Expired {
                expired.push(chain.id);
            }
        }
        Ok(expired)
    }

    pub fn public_listing(&self, listing_id: &str) -> Result<PublicListing, ReferralError> {
        let listing = self
            .store
            .listing(listing_id)?
            .ok_or_else(|| ReferralError::ListingNotFound(listing_id.to_string()))?;
        Ok(sanitize(&listing, &self.anonymizer))
    }

    pub fn reveal(
        &self,
        signer: &AuditSigner,
        listing_id: &str,
        buyer_id: &str,
        payment: &PaymentConfirmation,
    ) -> Result<RevealedContact, ReferralError> {
        reveal_contact(
            self.store.as_ref(),
            signer,
            listing_id,
            buyer_id,
            payment,
            self.clock.now_ms(),
        )
    }

    /// Reject a share that would attach a locked prospect to a second chain.
    /// The attempt is still assessed so repeated tries show up in the audit
    /// trail.
    fn enforce_contact_locking(
        &self,
        actor: &Actor,
        listing: &Listing,
        fingerprint: Option<&Fingerprint>,
        lock: &ContactLock,
        locked_chain: &ReferralChain,
        now: u64,
    ) -> ReferralError {
        if let Err(err) = self.assess(actor, RiskAction::CreateChain, listing, fingerprint, now) {
            return err;
        }
        warn!(
            listing_id = %listing.id,
            chain_id = %locked_chain.id,
            user_id = %actor.user_id,
            "contact already locked to another chain"
        );
        ReferralError::ContactAlreadyLocked {
            chain_code: locked_chain.code.clone(),
            expires_at_ms: lock.expires_at_ms,
        }
    }

    fn assess(
        &self,
        actor: &Actor,
        action: RiskAction,
        listing: &Listing,
        fingerprint: Option<&Fingerprint>,
        now: u64,
    ) -> Result<RiskAssessment, ReferralError> {
        let ctx = RiskContext {
            listing_id: &listing.id,
            seller_id: &listing.seller_id,
            fingerprint,
            now_ms: now,
        };
        let assessment = self.fraud.assess(self.store.as_ref(), actor, action, &ctx)?;
        if assessment.decision.is_blocking() {
            return Err(ReferralError::RiskBlocked {
                points: assessment.points,
                decision: assessment.decision,
            });
        }
        Ok(assessment)
    }

    fn create_chain(
        &self,
        listing: &Listing,
        referrer_id: &UserId,
        fingerprint: Option<&Fingerprint>,
        now: u64,
    ) -> Result<(ReferralChain, ReferralLink, bool), ReferralError> {
        let status = if self.max_degrees(listing) <= 1 {
            ChainStatus::Full
        } else {
            ChainStatus::Open
        };
        let mut released_stale = false;
        loop {
            let chain_id = Uuid::new_v4();
            let chain = ReferralChain {
                id: chain_id,
                listing_id: listing.id.clone(),
                code: generate_chain_code(),
                status,
                created_at_ms: now,
                last_activity_ms: now,
            };
            let first_link = ReferralLink {
                id: Uuid::new_v4(),
                chain_id,
                degree: 1,
                referrer_id: referrer_id.clone(),
                referral_code: generate_tracking_code(),
                created_at_ms: now,
            };
            let lock = fingerprint.map(|fp| ContactLock::new(listing.id.clone(), chain_id, fp, now));

            let created = self.store.create_chain(
                NewChain {
                    chain: chain.clone(),
                    first_link: first_link.clone(),
                    lock,
                },
                now,
            )?;
            let winner = match created {
                ChainCreate::Created => {
                    debug!(%chain_id, listing_id = %listing.id, "chain created");
                    return Ok((chain, first_link, true));
                }
                ChainCreate::LockHeld(winner) => winner,
            };
            let held = self
                .store
                .chain(winner.chain_id)?
                .ok_or(ReferralError::ChainNotFound)?;
            if self.effective_status(&held, now).is_terminal() && !released_stale {
                // The lock outlived its chain; once the expiry is stored the
                // lock stops holding.
                released_stale = true;
                self.expire_if_stale(held.id)?;
                continue;
            }
            debug!(
                chain_id = %held.id,
                listing_id = %listing.id,
                "lost lock race, extending winning chain"
            );
            let link = self.append_to(&held, referrer_id, listing, now)?;
            return Ok((held, link, false));
        }
    }

    fn append_to(
        &self,
        chain: &ReferralChain,
        referrer_id: &str,
        listing: &Listing,
        now: u64,
    ) -> Result<ReferralLink, ReferralError> {
        let status = self.effective_status(chain, now);
        if status.is_terminal() {
            return Err(ReferralError::ChainClosed { status });
        }
        let max_degrees = self.max_degrees(listing);
        let mut retries = 0;
        loop {
            let link = NewLink {
                referrer_id: referrer_id.to_string(),
                referral_code: generate_tracking_code(),
            };
            match self.store.append_link(chain.id, link, max_degrees, now) {
                Ok(LinkAppend::Inserted(link)) => {
                    debug!(chain_id = %chain.id, degree = link.degree, "degree appended");
                    return Ok(link);
                }
                Ok(LinkAppend::Existing(link)) => return Ok(link),
                Ok(LinkAppend::Full) => return Err(ReferralError::ChainFull { chain_id: chain.id }),
                Ok(LinkAppend::Closed(status)) => return Err(ReferralError::ChainClosed { status }),
                Err(err) if err.is_conflict() && retries < self.config.append_retries => {
                    retries += 1;
                    debug!(chain_id = %chain.id, retries, "degree append conflicted, retrying");
                }
                Err(err) if err.is_conflict() => {
                    let occupied = self.store.links(chain.id)?.len();
                    return Err(if occupied >= max_degrees as usize {
                        ReferralError::ChainFull { chain_id: chain.id }
                    } else {
                        ReferralError::StoreConflict
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Lock the prospect to `chain` if nobody holds them yet.
    fn claim_for(&self, chain: &ReferralChain, fingerprint: &Fingerprint, now: u64) -> Result<(), ReferralError> {
        let lock = ContactLock::new(chain.listing_id.clone(), chain.id, fingerprint, now);
        match self.store.insert_lock_if_absent(lock, now)? {
            LockInsert::Created(lock) => {
                debug!(chain_id = %chain.id, expires_at_ms = lock.expires_at_ms, "contact locked");
            }
            LockInsert::Existing(held) if held.chain_id != chain.id => {
                warn!(
                    chain_id = %chain.id,
                    held_by = %held.chain_id,
                    "contact claimed by another chain during share"
                );
            }
            LockInsert::Existing(_) => {}
        }
        Ok(())
    }

    /// The active lock for a fingerprint together with its chain, ignoring
    /// locks whose chain has closed. A chain that only reads as expired has
    /// the expiry stored so the store stops honouring its lock too.
    fn live_lock(
        &self,
        listing_id: &str,
        fingerprint: &Fingerprint,
        now: u64,
    ) -> Result<Option<(ContactLock, ReferralChain)>, ReferralError> {
        let Some(lock) = self.store.active_lock(listing_id, fingerprint, now)? else {
            return Ok(None);
        };
        match self.store.chain(lock.chain_id)? {
            Some(chain) if !self.effective_status(&chain, now).is_terminal() => Ok(Some((lock, chain))),
            Some(chain) => {
                if !chain.status.is_terminal() {
                    self.expire_if_stale(chain.id)?;
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn chain_on_listing(&self, code: &str, listing_id: &str) -> Result<ReferralChain, ReferralError> {
        match self.store.chain_by_code(code)? {
            Some(chain) if chain.listing_id == listing_id => Ok(chain),
            _ => Err(ReferralError::ChainNotFound),
        }
    }

    fn active_listing(&self, listing_id: &str) -> Result<Listing, ReferralError> {
        let listing = self
            .store
            .listing(listing_id)?
            .ok_or_else(|| ReferralError::ListingNotFound(listing_id.to_string()))?;
        if !listing.is_active() {
            return Err(ReferralError::ListingUnavailable(listing.id));
        }
        Ok(listing)
    }

    fn fingerprint(&self, contact: &Contact) -> Result<Fingerprint, ReferralError> {
        let mut fp = fingerprint::fingerprint(contact)?;
        fp.lock_duration_hours = self.config.lock_duration_hours;
        Ok(fp)
    }

    fn accepts_degrees(&self, chain: &ReferralChain, now: u64) -> bool {
        self.effective_status(chain, now).accepts_degrees()
    }

    fn effective_status(&self, chain: &ReferralChain, now: u64) -> ChainStatus {
        chain.effective_status(now, self.config.chain_inactivity_ms())
    }

    fn max_degrees(&self, listing: &Listing) -> u8 {
        listing.max_degrees.min(self.config.max_degrees)
    }
}
