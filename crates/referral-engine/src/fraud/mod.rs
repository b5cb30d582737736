//! Rule-based risk scoring for chain actions.
//!
//! Each factor contributes fixed points out of 100; the total is capped at
//! 100 and mapped to a decision by [`FraudConfig`] thresholds. Scores are
//! integer points so decisions never depend on float rounding.

use std::collections::BTreeSet;

use bacon_core::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{ChainStore, StoreError};
use crate::types::{
    ActivityKind, Actor, ChainId, ListingId, UserId, VerificationLevel, MS_PER_DAY, MS_PER_HOUR,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FraudConfig {
    pub new_account_days: u64,
    pub new_account_points: u32,
    pub unverified_points: u32,
    pub rapid_window_minutes: u64,
    pub rapid_action_threshold: usize,
    pub rapid_action_points: u32,
    pub elevated_action_threshold: usize,
    pub elevated_action_points: u32,
    /// Added on top when a new account also trips the rapid-action rule.
    #[serde(default = "default_new_account_burst_points")]
    pub new_account_burst_points: u32,
    pub device_accounts_threshold: usize,
    pub device_reuse_points: u32,
    pub purchase_window_hours: u64,
    pub purchase_threshold: usize,
    pub purchase_velocity_points: u32,
    pub contact_variation_days: u64,
    pub contact_variation_chains: usize,
    pub contact_variation_points: u32,
    pub self_referral_points: u32,
    /// Scores above this require identity verification.
    pub verification_above: u32,
    /// Scores above this are held for manual review.
    pub review_above: u32,
    /// Scores at or above this are blocked outright.
    pub block_at: u32,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            new_account_days: 7,
            new_account_points: 30,
            unverified_points: 20,
            rapid_window_minutes: 60,
            rapid_action_threshold: 10,
            rapid_action_points: 40,
            elevated_action_threshold: 5,
            elevated_action_points: 15,
            new_account_burst_points: default_new_account_burst_points(),
            device_accounts_threshold: 3,
            device_reuse_points: 30,
            purchase_window_hours: 24,
            purchase_threshold: 5,
            purchase_velocity_points: 25,
            contact_variation_days: 7,
            contact_variation_chains: 3,
            contact_variation_points: 40,
            self_referral_points: 50,
            verification_above: 60,
            review_above: 80,
            block_at: 100,
        }
    }
}

fn default_new_account_burst_points() -> u32 {
    30
}

impl FraudConfig {
    pub fn validate(&self) -> Result<(), crate::config::ConfigError> {
        if !(self.verification_above < self.review_above && self.review_above < self.block_at)
            || self.block_at > 100
        {
            return Err(crate::config::ConfigError::InvalidValue {
                key: "fraud thresholds".into(),
                reason: "need verification_above < review_above < block_at <= 100".into(),
            });
        }
        Ok(())
    }

    fn decide(&self, points: u32) -> RiskDecision {
        if points >= self.block_at {
            RiskDecision::Block
        } else if points > self.review_above {
            RiskDecision::ManualReview
        } else if points > self.verification_above {
            RiskDecision::RequireVerification
        } else {
            RiskDecision::Allow
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    CreateChain,
    ExtendChain,
    Purchase,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskDecision {
    Allow,
    /// Allowed, but the user must verify identity before further chain actions.
    RequireVerification,
    /// Held pending manual review.
    ManualReview,
    Block,
}

impl RiskDecision {
    pub fn is_blocking(self) -> bool {
        matches!(self, RiskDecision::ManualReview | RiskDecision::Block)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "factor", rename_all = "snake_case")]
pub enum RiskFactor {
    NewAccount { age_days: u64 },
    LowVerification,
    RapidActions { count: usize, window_minutes: u64 },
    ElevatedActions { count: usize, window_minutes: u64 },
    /// A new account acting at the rapid rate.
    NewAccountBurst,
    DeviceReuse { accounts: usize },
    PurchaseVelocity { count: usize, window_hours: u64 },
    ContactVariation { chains: usize },
    SelfReferral,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RiskAssessment {
    pub user_id: UserId,
    pub action: RiskAction,
    pub listing_id: ListingId,
    pub factors: Vec<RiskFactor>,
    /// Capped at 100.
    pub points: u32,
    pub score: f64,
    pub decision: RiskDecision,
    pub assessed_at_ms: u64,
}

/// Facts about the action being assessed that the store cannot provide.
#[derive(Clone, Debug)]
pub struct RiskContext<'a> {
    pub listing_id: &'a str,
    pub seller_id: &'a str,
    pub fingerprint: Option<&'a Fingerprint>,
    pub now_ms: u64,
}

/// Observed signals, before weighting.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RiskSignals {
    pub account_age_days: u64,
    pub verification: Option<VerificationLevel>,
    /// Actions in the rapid window, counting the one being assessed.
    pub recent_actions: usize,
    pub device_accounts: usize,
    pub recent_purchases: usize,
    pub variant_chains: usize,
    pub self_referral: bool,
}

#[derive(Clone, Debug, Default)]
pub struct FraudMonitor {
    config: FraudConfig,
}

impl FraudMonitor {
    pub fn new(config: FraudConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FraudConfig {
        &self.config
    }

    /// Read the behavioural signals for `actor` from the store.
    pub fn gather<S: ChainStore + ?Sized>(
        &self,
        store: &S,
        actor: &Actor,
        action: RiskAction,
        ctx: &RiskContext<'_>,
    ) -> Result<RiskSignals, StoreError> {
        let rapid_since = ctx
            .now_ms
            .saturating_sub(self.config.rapid_window_minutes * 60 * 1_000);
        let kind = match action {
            RiskAction::Purchase => ActivityKind::Purchase,
            RiskAction::CreateChain | RiskAction::ExtendChain => ActivityKind::Share,
        };
        let recent_actions = store.count_activity(&actor.user_id, kind, rapid_since)? + 1;

        let purchase_since = ctx
            .now_ms
            .saturating_sub(self.config.purchase_window_hours * MS_PER_HOUR);
        let mut recent_purchases =
            store.count_activity(&actor.user_id, ActivityKind::Purchase, purchase_since)?;
        if action == RiskAction::Purchase {
            recent_purchases += 1;
        }

        let device_accounts = match actor.device.as_deref() {
            Some(device) => store.register_device(device, &actor.user_id)?,
            None => 0,
        };

        let variant_chains = match ctx.fingerprint {
            Some(fp) => {
                let since = ctx
                    .now_ms
                    .saturating_sub(self.config.contact_variation_days * MS_PER_DAY);
                let chains: BTreeSet<ChainId> = store
                    .locks_matching(ctx.listing_id, fp, since)?
                    .into_iter()
                    .map(|lock| lock.chain_id)
                    .collect();
                chains.len()
            }
            None => 0,
        };

        Ok(RiskSignals {
            account_age_days: actor.account_age_days(ctx.now_ms),
            verification: Some(actor.verification),
            recent_actions,
            device_accounts,
            recent_purchases,
            variant_chains,
            self_referral: action != RiskAction::Purchase && actor.user_id == ctx.seller_id,
        })
    }

    /// Weight signals into a decision. Pure.
    pub fn score(&self, signals: &RiskSignals) -> (Vec<RiskFactor>, u32, RiskDecision) {
        let cfg = &self.config;
        let mut factors = Vec::new();
        let mut points = 0u32;

        let new_account = signals.account_age_days < cfg.new_account_days;
        if new_account {
            factors.push(RiskFactor::NewAccount {
                age_days: signals.account_age_days,
            });
            points += cfg.new_account_points;
        }
        if signals.verification == Some(VerificationLevel::Unverified) {
            factors.push(RiskFactor::LowVerification);
            points += cfg.unverified_points;
        }
        if signals.recent_actions > cfg.rapid_action_threshold {
            factors.push(RiskFactor::RapidActions {
                count: signals.recent_actions,
                window_minutes: cfg.rapid_window_minutes,
            });
            points += cfg.rapid_action_points;
            if new_account {
                factors.push(RiskFactor::NewAccountBurst);
                points += cfg.new_account_burst_points;
            }
        } else if signals.recent_actions > cfg.elevated_action_threshold {
            factors.push(RiskFactor::ElevatedActions {
                count: signals.recent_actions,
                window_minutes: cfg.rapid_window_minutes,
            });
            points += cfg.elevated_action_points;
        }
        if signals.device_accounts >= cfg.device_accounts_threshold {
            factors.push(RiskFactor::DeviceReuse {
                accounts: signals.device_accounts,
            });
            points += cfg.device_reuse_points;
        }
        if signals.recent_purchases > cfg.purchase_threshold {
            factors.push(RiskFactor::PurchaseVelocity {
                count: signals.recent_purchases,
                window_hours: cfg.purchase_window_hours,
            });
            points += cfg.purchase_velocity_points;
        }
        if signals.variant_chains >= cfg.contact_variation_chains {
            factors.push(RiskFactor::ContactVariation {
                chains: signals.variant_chains,
            });
            points += cfg.contact_variation_points;
        }
        if signals.self_referral {
            factors.push(RiskFactor::SelfReferral);
            points += cfg.self_referral_points;
        }

        let points = points.min(100);
        (factors, points, cfg.decide(points))
    }

    /// Gather, score and persist an assessment for one action.
    pub fn assess<S: ChainStore + ?Sized>(
        &self,
        store: &S,
        actor: &Actor,
        action: RiskAction,
        ctx: &RiskContext<'_>,
    ) -> Result<RiskAssessment, StoreError> {
        let signals = self.gather(store, actor, action, ctx)?;
        let (factors, points, decision) = self.score(&signals);
        let assessment = RiskAssessment {
            user_id: actor.user_id.clone(),
            action,
            listing_id: ctx.listing_id.to_string(),
            factors,
            points,
            score: points as f64 / 100.0,
            decision,
            assessed_at_ms: ctx.now_ms,
        };
        if decision.is_blocking() {
            warn!(
                user_id = %assessment.user_id,
                ?action,
                points,
                ?decision,
                "risk assessment blocked action"
            );
        } else if decision == RiskDecision::RequireVerification {
            info!(user_id = %assessment.user_id, ?action, points, "verification required");
        }
        store.record_assessment(assessment.clone())?;
        Ok(assessment)
    }
}
