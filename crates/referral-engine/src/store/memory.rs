use std::collections::{BTreeMap, BTreeSet};

use bacon_core::fingerprint::Fingerprint;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    ChainCreate, ChainStore, LinkAppend, LockInsert, NewChain, NewLink, SaleCommit, StoreError,
};
use crate::audit::RevealReceipt;
use crate::fraud::RiskAssessment;
use crate::listing::{Listing, ListingStatus};
use crate::payout::BaconDistribution;
use crate::types::{
    ActivityKind, ActivityRecord, ChainId, ChainStatus, ContactLock, ListingId, ReferralChain,
    ReferralLink, UserId,
};

/// Serializable image of every table the store holds.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub listings: BTreeMap<ListingId, Listing>,
    #[serde(default)]
    pub chains: BTreeMap<ChainId, ReferralChain>,
    #[serde(default)]
    pub links: BTreeMap<ChainId, Vec<ReferralLink>>,
    #[serde(default)]
    pub locks: Vec<ContactLock>,
    #[serde(default)]
    pub distributions: BTreeMap<ChainId, BaconDistribution>,
    #[serde(default)]
    pub activity: Vec<ActivityRecord>,
    #[serde(default)]
    pub devices: BTreeMap<String, BTreeSet<UserId>>,
    #[serde(default)]
    pub assessments: Vec<RiskAssessment>,
    #[serde(default)]
    pub reveals: Vec<RevealReceipt>,
}

impl StoreSnapshot {
    /// Unexpired locks stop holding once their chain is stored as terminal.
    fn is_live(&self, lock: &ContactLock, now_ms: u64) -> bool {
        lock.is_active(now_ms)
            && self
                .chains
                .get(&lock.chain_id)
                .map_or(true, |chain| !chain.status.is_terminal())
    }

    fn active_lock_for(&self, listing_id: &str, fingerprint: &Fingerprint, now_ms: u64) -> Option<&ContactLock> {
        self.locks.iter().find(|lock| {
            lock.listing_id == listing_id && lock.claims(fingerprint) && self.is_live(lock, now_ms)
        })
    }

    fn held_lock(&self, claim: &ContactLock, now_ms: u64) -> Option<&ContactLock> {
        self.locks.iter().find(|existing| {
            existing.listing_id == claim.listing_id
                && existing.primary_hash == claim.primary_hash
                && self.is_live(existing, now_ms)
        })
    }
}

/// In-process [`ChainStore`]. Each trait method runs under one write or read
/// guard, which makes it atomic with respect to every other method.
#[derive(Debug, Default)]
pub struct MemoryChainStore {
    state: RwLock<StoreSnapshot>,
}

impl MemoryChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.read().clone()
    }
}

impl ChainStore for MemoryChainStore {
    fn insert_listing(&self, listing: Listing) -> Result<(), StoreError> {
        self.state.write().listings.insert(listing.id.clone(), listing);
        Ok(())
    }

    fn listing(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        Ok(self.state.read().listings.get(id).cloned())
    }

    fn set_listing_status(&self, id: &str, status: ListingStatus) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let listing = state
            .listings
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(format!("listing {id}")))?;
        listing.status = status;
        Ok(())
    }

    fn create_chain(&self, new: NewChain, now_ms: u64) -> Result<ChainCreate, StoreError> {
        let mut state = self.state.write();
        if let Some(lock) = &new.lock {
            if let Some(held) = state.held_lock(lock, now_ms) {
                return Ok(ChainCreate::LockHeld(held.clone()));
            }
        }
        if state.chains.contains_key(&new.chain.id)
            || state.chains.values().any(|c| c.code == new.chain.code)
        {
            return Err(StoreError::conflict(format!("chain code {}", new.chain.code)));
        }

        let chain_id = new.chain.id;
        debug!(%chain_id, listing_id = %new.chain.listing_id, "chain inserted");
        state.chains.insert(chain_id, new.chain);
        state.links.insert(chain_id, vec![new.first_link]);
        if let Some(lock) = new.lock {
            state.locks.push(lock);
        }
        Ok(ChainCreate::Created)
    }

    fn append_link(
        &self,
        chain_id: ChainId,
        link: NewLink,
        max_degrees: u8,
        now_ms: u64,
    ) -> Result<LinkAppend, StoreError> {
        let mut state = self.state.write();
        let StoreSnapshot { chains, links, .. } = &mut *state;
        let chain = chains
            .get_mut(&chain_id)
            .ok_or_else(|| StoreError::not_found(format!("chain {chain_id}")))?;
        let chain_links = links.entry(chain_id).or_default();

        if let Some(existing) = chain_links.iter().find(|l| l.referrer_id == link.referrer_id) {
            return Ok(LinkAppend::Existing(existing.clone()));
        }
        if chain.status.is_terminal() {
            return Ok(LinkAppend::Closed(chain.status));
        }
        let occupied = chain_links.len();
        if occupied >= max_degrees as usize {
            return Ok(LinkAppend::Full);
        }

        let degree = occupied as u8 + 1;
        let inserted = ReferralLink {
            id: uuid::Uuid::new_v4(),
            chain_id,
            degree,
            referrer_id: link.referrer_id,
            referral_code: link.referral_code,
            created_at_ms: now_ms,
        };
        chain_links.push(inserted.clone());
        chain.last_activity_ms = now_ms;
        if degree == max_degrees {
            chain.status = ChainStatus::Full;
        }
        Ok(LinkAppend::Inserted(inserted))
    }

    fn insert_lock_if_absent(&self, lock: ContactLock, now_ms: u64) -> Result<LockInsert, StoreError> {
        let mut state = self.state.write();
        if let Some(held) = state.held_lock(&lock, now_ms) {
            return Ok(LockInsert::Existing(held.clone()));
        }
        state.locks.push(lock.clone());
        Ok(LockInsert::Created(lock))
    }

    fn active_lock(
        &self,
        listing_id: &str,
        fingerprint: &Fingerprint,
        now_ms: u64,
    ) -> Result<Option<ContactLock>, StoreError> {
        Ok(self
            .state
            .read()
            .active_lock_for(listing_id, fingerprint, now_ms)
            .cloned())
    }

    fn locks_matching(
        &self,
        listing_id: &str,
        fingerprint: &Fingerprint,
        since_ms: u64,
    ) -> Result<Vec<ContactLock>, StoreError> {
        Ok(self
            .state
            .read()
            .locks
            .iter()
            .filter(|lock| {
                lock.listing_id == listing_id
                    && lock.created_at_ms >= since_ms
                    && lock.overlaps(fingerprint)
            })
            .cloned()
            .collect())
    }

    fn chain(&self, id: ChainId) -> Result<Option<ReferralChain>, StoreError> {
        Ok(self.state.read().chains.get(&id).cloned())
    }

    fn chain_by_code(&self, code: &str) -> Result<Option<ReferralChain>, StoreError> {
        Ok(self
            .state
            .read()
            .chains
            .values()
            .find(|c| c.code == code)
            .cloned())
    }

    fn chains_for_listing(&self, listing_id: &str) -> Result<Vec<ReferralChain>, StoreError> {
        let mut chains: Vec<ReferralChain> = self
            .state
            .read()
            .chains
            .values()
            .filter(|c| c.listing_id == listing_id)
            .cloned()
            .collect();
        chains.sort_by_key(|c| (c.created_at_ms, c.id));
        Ok(chains)
    }

    fn links(&self, chain_id: ChainId) -> Result<Vec<ReferralLink>, StoreError> {
        let mut links = self
            .state
            .read()
            .links
            .get(&chain_id)
            .cloned()
            .unwrap_or_default();
        links.sort_by_key(|l| l.degree);
        Ok(links)
    }

    fn link_by_code(&self, chain_id: ChainId, referral_code: &str) -> Result<Option<ReferralLink>, StoreError> {
        Ok(self.state.read().links.get(&chain_id).and_then(|links| {
            links
                .iter()
                .find(|l| l.referral_code == referral_code)
                .cloned()
        }))
    }

    fn transition_chain(
        &self,
        chain_id: ChainId,
        expected: ChainStatus,
        next: ChainStatus,
    ) -> Result<ReferralChain, StoreError> {
        let mut state = self.state.write();
        let chain = state
            .chains
            .get_mut(&chain_id)
            .ok_or_else(|| StoreError::not_found(format!("chain {chain_id}")))?;
        if chain.status != expected || !expected.can_transition_to(next) {
            return Err(StoreError::conflict(format!(
                "chain {chain_id} status {:?}, expected {:?}",
                chain.status, expected
            )));
        }
        chain.status = next;
        Ok(chain.clone())
    }

    fn complete_chain(&self, distribution: BaconDistribution) -> Result<SaleCommit, StoreError> {
        let mut state = self.state.write();
        let chain_id = distribution.chain_id;
        let chain = state
            .chains
            .get(&chain_id)
            .ok_or_else(|| StoreError::not_found(format!("chain {chain_id}")))?;
        if chain.status.is_terminal() || state.distributions.contains_key(&chain_id) {
            return Ok(SaleCommit::ChainClosed(chain.status));
        }
        let listing = state
            .listings
            .get(&chain.listing_id)
            .ok_or_else(|| StoreError::not_found(format!("listing {}", chain.listing_id)))?;
        if listing.status != ListingStatus::Active {
            return Ok(SaleCommit::ListingUnavailable(listing.status));
        }
        let occupied = state.links.get(&chain_id).map_or(0, Vec::len);
        if occupied != distribution.lines.len() {
            return Err(StoreError::conflict(format!(
                "chain {chain_id} has {occupied} degrees, distribution covers {}",
                distribution.lines.len()
            )));
        }

        let StoreSnapshot {
            chains,
            listings,
            distributions,
            ..
        } = &mut *state;
        let chain = chains
            .get_mut(&chain_id)
            .ok_or_else(|| StoreError::not_found(format!("chain {chain_id}")))?;
        chain.status = ChainStatus::Completed;
        if let Some(listing) = listings.get_mut(&chain.listing_id) {
            listing.status = ListingStatus::Sold;
        }
        let completed = chain.clone();
        distributions.insert(chain_id, distribution);
        debug!(%chain_id, listing_id = %completed.listing_id, "sale committed");
        Ok(SaleCommit::Committed(completed))
    }

    fn distribution(&self, chain_id: ChainId) -> Result<Option<BaconDistribution>, StoreError> {
        Ok(self.state.read().distributions.get(&chain_id).cloned())
    }

    fn record_activity(&self, record: ActivityRecord) -> Result<(), StoreError> {
        self.state.write().activity.push(record);
        Ok(())
    }

    fn count_activity(&self, user_id: &str, kind: ActivityKind, since_ms: u64) -> Result<usize, StoreError> {
        Ok(self
            .state
            .read()
            .activity
            .iter()
            .filter(|a| a.user_id == user_id && a.kind == kind && a.at_ms >= since_ms)
            .count())
    }

    fn register_device(&self, device: &str, user_id: &str) -> Result<usize, StoreError> {
        let mut state = self.state.write();
        let users = state.devices.entry(device.to_string()).or_default();
        users.insert(user_id.to_string());
        Ok(users.len())
    }

    fn record_assessment(&self, assessment: RiskAssessment) -> Result<(), StoreError> {
        self.state.write().assessments.push(assessment);
        Ok(())
    }

    fn assessments(&self, user_id: &str) -> Result<Vec<RiskAssessment>, StoreError> {
        Ok(self
            .state
            .read()
            .assessments
            .iter()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect())
    }

    fn record_reveal(&self, receipt: RevealReceipt) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let duplicate = state.reveals.iter().any(|r| {
            r.core.listing_id == receipt.core.listing_id && r.core.buyer_id == receipt.core.buyer_id
        });
        if duplicate {
            return Err(StoreError::conflict(format!(
                "reveal of listing {} to {}",
                receipt.core.listing_id, receipt.core.buyer_id
            )));
        }
        state.reveals.push(receipt);
        Ok(())
    }

    fn reveals(&self, listing_id: &str) -> Result<Vec<RevealReceipt>, StoreError> {
        Ok(self
            .state
            .read()
            .reveals
            .iter()
            .filter(|r| r.core.listing_id == listing_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::tests::sample_listing;
    use bacon_core::fingerprint::{fingerprint, Contact};
    use bacon_core::payout::{Cents, RewardRate};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use uuid::Uuid;

    fn seeded_chain(store: &MemoryChainStore, lock: Option<ContactLock>) -> (ChainId, ChainCreate) {
        let chain_id = Uuid::new_v4();
        let created = store
            .create_chain(
                NewChain {
                    chain: ReferralChain {
                        id: chain_id,
                        listing_id: "lst-1".into(),
                        code: bacon_core::codes::generate_chain_code(),
                        status: ChainStatus::Open,
                        created_at_ms: 0,
                        last_activity_ms: 0,
                    },
                    first_link: ReferralLink {
                        id: Uuid::new_v4(),
                        chain_id,
                        degree: 1,
                        referrer_id: "ref-1".into(),
                        referral_code: bacon_core::codes::generate_tracking_code(),
                        created_at_ms: 0,
                    },
                    lock,
                },
                0,
            )
            .unwrap();
        (chain_id, created)
    }

    fn new_link(referrer: &str) -> NewLink {
        NewLink {
            referrer_id: referrer.into(),
            referral_code: bacon_core::codes::generate_tracking_code(),
        }
    }

    #[test]
    fn append_fills_contiguous_degrees_then_reports_full() {
        let store = MemoryChainStore::new();
        let (chain_id, _) = seeded_chain(&store, None);
        for idx in 2..=6 {
            match store.append_link(chain_id, new_link(&format!("ref-{idx}")), 6, 10).unwrap() {
                LinkAppend::Inserted(link) => assert_eq!(link.degree, idx),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(store.chain(chain_id).unwrap().unwrap().status, ChainStatus::Full);
        assert_eq!(store.append_link(chain_id, new_link("ref-7"), 6, 10).unwrap(), LinkAppend::Full);
    }

    #[test]
    fn referrer_cannot_hold_two_degrees() {
        let store = MemoryChainStore::new();
        let (chain_id, _) = seeded_chain(&store, None);
        match store.append_link(chain_id, new_link("ref-1"), 6, 10).unwrap() {
            LinkAppend::Existing(link) => assert_eq!(link.degree, 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.links(chain_id).unwrap().len(), 1);
    }

    #[test]
    fn second_lock_on_same_fingerprint_is_refused_until_expiry() {
        let store = MemoryChainStore::new();
        let fp = fingerprint(&Contact::email("buyer@uob.edu")).unwrap();
        let first = ContactLock::new("lst-1".into(), Uuid::new_v4(), &fp, 0);
        let (_, created) = seeded_chain(&store, Some(first.clone()));
        assert_eq!(created, ChainCreate::Created);

        let second = ContactLock::new("lst-1".into(), Uuid::new_v4(), &fp, 0);
        let (_, refused) = seeded_chain(&store, Some(second.clone()));
        assert_eq!(refused, ChainCreate::LockHeld(first.clone()));

        let later = first.expires_at_ms;
        let renewed = ContactLock::new("lst-1".into(), Uuid::new_v4(), &fp, later);
        match store.insert_lock_if_absent(renewed.clone(), later).unwrap() {
            LockInsert::Created(lock) => assert_eq!(lock.id, renewed.id),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.active_lock("lst-1", &fp, later).unwrap(), Some(renewed));
    }

    #[test]
    fn concurrent_appends_assign_distinct_degrees() {
        let store = Arc::new(MemoryChainStore::new());
        let (chain_id, _) = seeded_chain(&store, None);
        let barrier = Arc::new(Barrier::new(12));
        let handles: Vec<_> = (0..12)
            .map(|idx| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.append_link(chain_id, new_link(&format!("racer-{idx}")), 6, 1).unwrap()
                })
            })
            .collect();
        let results: Vec<LinkAppend> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let inserted = results.iter().filter(|r| matches!(r, LinkAppend::Inserted(_))).count();
        assert_eq!(inserted, 5);
        let degrees: Vec<u8> = store.links(chain_id).unwrap().iter().map(|l| l.degree).collect();
        assert_eq!(degrees, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn terminal_chain_rejects_links_and_transitions() {
        let store = MemoryChainStore::new();
        let (chain_id, _) = seeded_chain(&store, None);
        store
            .transition_chain(chain_id, ChainStatus::Open, ChainStatus::Completed)
            .unwrap();
        assert_eq!(
            store.append_link(chain_id, new_link("late"), 6, 5).unwrap(),
            LinkAppend::Closed(ChainStatus::Completed)
        );
        let err = store
            .transition_chain(chain_id, ChainStatus::Completed, ChainStatus::Expired)
            .unwrap_err();
        assert!(err.is_conflict());
    }

    fn settlement(store: &MemoryChainStore, chain_id: ChainId) -> BaconDistribution {
        crate::payout::distribute(
            chain_id,
            "lst-1",
            Cents::from_dollars(1_000),
            RewardRate::from_percent(20).unwrap(),
            &store.links(chain_id).unwrap(),
            10,
        )
        .unwrap()
    }

    #[test]
    fn lock_stops_holding_once_its_chain_is_terminal() {
        let store = MemoryChainStore::new();
        let fp = fingerprint(&Contact::email("buyer@uob.edu")).unwrap();
        let chain_id = Uuid::new_v4();
        let (seeded, _) = seeded_chain(&store, None);
        store
            .insert_lock_if_absent(ContactLock::new("lst-1".into(), seeded, &fp, 0), 0)
            .unwrap();
        assert!(store.active_lock("lst-1", &fp, 1).unwrap().is_some());

        store
            .transition_chain(seeded, ChainStatus::Open, ChainStatus::Expired)
            .unwrap();
        assert_eq!(store.active_lock("lst-1", &fp, 1).unwrap(), None);
        let (_, created) = seeded_chain(
            &store,
            Some(ContactLock::new("lst-1".into(), chain_id, &fp, 1)),
        );
        assert_eq!(created, ChainCreate::Created);
    }

    #[test]
    fn complete_chain_settles_listing_chain_and_distribution_together() {
        let store = MemoryChainStore::new();
        store.insert_listing(sample_listing()).unwrap();
        let (first, _) = seeded_chain(&store, None);
        let (second, _) = seeded_chain(&store, None);

        let dist = settlement(&store, first);
        match store.complete_chain(dist.clone()).unwrap() {
            SaleCommit::Committed(chain) => assert_eq!(chain.status, ChainStatus::Completed),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(store.distribution(first).unwrap(), Some(dist.clone()));
        assert_eq!(store.listing("lst-1").unwrap().unwrap().status, ListingStatus::Sold);

        assert_eq!(
            store.complete_chain(dist).unwrap(),
            SaleCommit::ChainClosed(ChainStatus::Completed)
        );
        assert_eq!(
            store.complete_chain(settlement(&store, second)).unwrap(),
            SaleCommit::ListingUnavailable(ListingStatus::Sold)
        );
        assert_eq!(store.distribution(second).unwrap(), None);
        assert_eq!(store.chain(second).unwrap().unwrap().status, ChainStatus::Open);
    }

    #[test]
    fn complete_chain_rejects_a_stale_distribution() {
        let store = MemoryChainStore::new();
        store.insert_listing(sample_listing()).unwrap();
        let (chain_id, _) = seeded_chain(&store, None);
        let stale = settlement(&store, chain_id);
        store.append_link(chain_id, new_link("ref-2"), 6, 5).unwrap();

        let err = store.complete_chain(stale).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.chain(chain_id).unwrap().unwrap().status, ChainStatus::Open);
        assert!(store.listing("lst-1").unwrap().unwrap().is_active());
    }

    #[test]
    fn snapshot_survives_json_round_trip() {
        let store = MemoryChainStore::new();
        store.insert_listing(sample_listing()).unwrap();
        let (chain_id, _) = seeded_chain(&store, None);
        store.register_device("device-1", "ref-1").unwrap();

        let json = serde_json::to_string(&store.snapshot()).unwrap();
        let restored = MemoryChainStore::from_snapshot(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.snapshot(), store.snapshot());
        assert_eq!(restored.links(chain_id).unwrap().len(), 1);
        assert_eq!(restored.register_device("device-1", "ref-2").unwrap(), 2);
    }
}
