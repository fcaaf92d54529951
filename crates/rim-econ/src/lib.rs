#![deny(warnings)]

//! The tier/economy engine for the RIM grid.
//!
//! This crate owns the only non-trivial branching logic in the system:
//! - Tier derivation under a policy-selectable unlock predicate
//! - Effective multiplier with the overheat hard-zero and the booster bonus
//! - Per-tick earnings (mining term + capped referral term)
//! - The artifact-tier overheat advance that arms the cooldown lockout
//!
//! All randomness in the economic path is confined to the bounded load
//! factor, so everything else stays deterministic and testable.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use rim_core::{validate_tier_table, Account, Buff, Tier, TierId, TierTable, ValidationError};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Errors produced by the economy engine.
#[derive(Debug, Error, PartialEq)]
pub enum EconError {
    /// A tuning parameter is out of its documented range.
    #[error("invalid engine parameter: {0}")]
    InvalidParams(&'static str),
    /// The tier ladder failed validation.
    #[error("invalid tier table: {0}")]
    InvalidTable(#[from] ValidationError),
    /// The supplied load factor is outside the configured range.
    #[error("load factor {0} outside configured range")]
    InvalidLoadFactor(f64),
    /// Numeric conversion to decimal failed.
    #[error("non-finite numeric conversion")]
    NonFinite,
}

/// Which unlock predicate gates tier derivation.
///
/// Exactly one policy is active per engine instance; the two are never mixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierPolicy {
    /// A tier is unlocked once the cumulative balance reaches its threshold.
    BalanceGated,
    /// A tier is unlocked by owning its rig; the base tier is always unlocked.
    OwnershipGated,
}

/// Engine tuning parameters. Defaults match the production deployment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EconParams {
    /// Base accrual per tick before multipliers.
    pub base_rate: f64,
    /// Multiplier applied while the booster buff is unexpired.
    pub booster_factor: f64,
    /// Referral-term multiplier while the botnet buff is unexpired.
    pub botnet_referral_factor: f64,
    /// Accrual per counted referral per tick.
    pub referral_rate_per_tick: f64,
    /// Global emission scaling; 1.0 until the first halving.
    pub halving_multiplier: f64,
    /// Divisor normalizing the mining term to the tick cadence.
    pub rate_unit_divisor: f64,
    /// Lower bound of the cosmetic load-factor variate.
    pub load_factor_min: f64,
    /// Upper bound of the cosmetic load-factor variate.
    pub load_factor_max: f64,
    /// Active seconds allowed on the artifact tier before overheating.
    pub artifact_daily_limit_secs: i64,
    /// Length of the lockout armed by an overheat, in seconds.
    pub cooldown_secs: i64,
}

impl Default for EconParams {
    fn default() -> Self {
        EconParams {
            base_rate: 0.1,
            booster_factor: 1.2,
            botnet_referral_factor: 2.0,
            referral_rate_per_tick: 0.003,
            halving_multiplier: 1.0,
            rate_unit_divisor: 10.0,
            load_factor_min: 0.8,
            load_factor_max: 1.0,
            artifact_daily_limit_secs: 4 * 3_600,
            cooldown_secs: 20 * 3_600,
        }
    }
}

fn validate_params(p: &EconParams) -> Result<(), EconError> {
    let finite = [
        p.base_rate,
        p.booster_factor,
        p.botnet_referral_factor,
        p.referral_rate_per_tick,
        p.halving_multiplier,
        p.rate_unit_divisor,
        p.load_factor_min,
        p.load_factor_max,
    ];
    if finite.iter().any(|v| !v.is_finite()) {
        return Err(EconError::InvalidParams("non-finite parameter"));
    }
    if p.base_rate < 0.0 || p.referral_rate_per_tick < 0.0 {
        return Err(EconError::InvalidParams("negative rate"));
    }
    if p.booster_factor < 1.0 || p.botnet_referral_factor < 1.0 {
        return Err(EconError::InvalidParams("buff factor below 1.0"));
    }
    if p.halving_multiplier <= 0.0 || p.rate_unit_divisor <= 0.0 {
        return Err(EconError::InvalidParams("non-positive scaling"));
    }
    if p.load_factor_min <= 0.0 || p.load_factor_min > p.load_factor_max {
        return Err(EconError::InvalidParams("empty load factor range"));
    }
    if p.artifact_daily_limit_secs <= 0 || p.cooldown_secs <= 0 {
        return Err(EconError::InvalidParams("non-positive duration"));
    }
    Ok(())
}

/// Ephemeral per-tick view of an account's earning position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EarningContext {
    /// The tier currently derived for the account.
    pub tier_id: TierId,
    /// Multiplier after lockout and booster adjustments.
    pub effective_multiplier: f64,
    /// Referrals counted toward earnings, capped by the tier bandwidth.
    pub active_referrals: u32,
    /// Whether an overheat cooldown is pending.
    pub is_locked: bool,
}

/// Derives tiers, computes per-tick earnings, and advances the overheat
/// state for one deployment's tier ladder and policy.
#[derive(Clone, Debug)]
pub struct EconomyEngine {
    table: TierTable,
    policy: TierPolicy,
    params: EconParams,
}

impl EconomyEngine {
    /// Build an engine, validating both the ladder and the parameters.
    pub fn new(
        table: TierTable,
        policy: TierPolicy,
        params: EconParams,
    ) -> Result<Self, EconError> {
        validate_tier_table(&table)?;
        validate_params(&params)?;
        Ok(EconomyEngine {
            table,
            policy,
            params,
        })
    }

    /// The ladder this engine derives tiers from.
    pub fn table(&self) -> &TierTable {
        &self.table
    }

    /// The active unlock policy.
    pub fn policy(&self) -> TierPolicy {
        self.policy
    }

    /// The tuning parameters.
    pub fn params(&self) -> &EconParams {
        &self.params
    }

    /// Highest-ranked tier whose unlock predicate holds for the account.
    pub fn derive_tier(&self, account: &Account) -> &Tier {
        self.table
            .ranked_desc()
            .find(|tier| self.unlocked(account, tier))
            .unwrap_or_else(|| self.table.base())
    }

    fn unlocked(&self, account: &Account, tier: &Tier) -> bool {
        match self.policy {
            TierPolicy::BalanceGated => account.balance >= tier.threshold,
            TierPolicy::OwnershipGated => tier
                .unlock_rig
                .as_ref()
                .map_or(true, |rig| account.inventory.contains(rig)),
        }
    }

    /// True while the account's overheat cooldown is pending. Delegates to
    /// the account so the check is always against fresh state.
    pub fn is_locked(&self, account: &Account, now: DateTime<Utc>) -> bool {
        account.is_locked(now)
    }

    /// Tier multiplier adjusted for lockout and the booster buff.
    ///
    /// A pending cooldown yields exactly 0.0: earnings are fully suspended
    /// during lockout, not merely reduced.
    pub fn effective_multiplier(&self, account: &Account, tier: &Tier, now: DateTime<Utc>) -> f64 {
        if self.is_locked(account, now) {
            return 0.0;
        }
        let mut multiplier = tier.multiplier;
        if account.buff_active(Buff::Booster, now) {
            multiplier *= self.params.booster_factor;
        }
        multiplier
    }

    /// Referrals counted toward earnings, never exceeding the tier bandwidth.
    pub fn active_referrals(&self, account: &Account, tier: &Tier) -> u32 {
        account.referral_count.min(tier.bandwidth_cap)
    }

    /// Snapshot of the earning position, recomputed every tick.
    pub fn context(&self, account: &Account, now: DateTime<Utc>) -> EarningContext {
        let tier = self.derive_tier(account);
        EarningContext {
            tier_id: tier.id,
            effective_multiplier: self.effective_multiplier(account, tier, now),
            active_referrals: self.active_referrals(account, tier),
            is_locked: self.is_locked(account, now),
        }
    }

    /// Balance delta for one tick, rounded to 3 decimal places.
    ///
    /// Returns zero immediately while locked: no partial referral credit
    /// accrues during a cooldown. The load factor must come from
    /// [`sample_load_factor`](Self::sample_load_factor) or lie within the
    /// configured range.
    pub fn compute_earnings(
        &self,
        account: &Account,
        tier: &Tier,
        now: DateTime<Utc>,
        load_factor: f64,
    ) -> Result<Decimal, EconError> {
        if !load_factor.is_finite()
            || load_factor < self.params.load_factor_min
            || load_factor > self.params.load_factor_max
        {
            return Err(EconError::InvalidLoadFactor(load_factor));
        }
        let multiplier = self.effective_multiplier(account, tier, now);
        if multiplier == 0.0 {
            return Ok(Decimal::ZERO);
        }
        let mining = self.params.base_rate * multiplier * load_factor * self.params.halving_multiplier
            / self.params.rate_unit_divisor;
        let referral_multiplier = if account.buff_active(Buff::Botnet, now) {
            self.params.botnet_referral_factor
        } else {
            1.0
        };
        let referral = f64::from(self.active_referrals(account, tier))
            * self.params.referral_rate_per_tick
            * referral_multiplier;
        Decimal::from_f64(mining + referral)
            .map(|delta| delta.round_dp(3))
            .ok_or(EconError::NonFinite)
    }

    /// Uniform load factor in the configured range; the only randomness in
    /// the economic path.
    pub fn sample_load_factor<R: Rng>(&self, rng: &mut R) -> f64 {
        rng.gen_range(self.params.load_factor_min..=self.params.load_factor_max)
    }

    /// Accumulate active time on the artifact tier and arm the cooldown once
    /// the daily limit is reached.
    ///
    /// Returns true when the account is overheated after this advance. An
    /// unexpired cooldown is never shortened by re-triggering; the usage
    /// accumulator resets when a new lockout is armed.
    pub fn advance_artifact_usage(
        &self,
        account: &mut Account,
        accumulated_secs: &mut i64,
        elapsed_secs: i64,
        now: DateTime<Utc>,
    ) -> bool {
        let tier = self.derive_tier(account);
        if !tier.artifact {
            return false;
        }
        *accumulated_secs += elapsed_secs.max(0);
        if *accumulated_secs < self.params.artifact_daily_limit_secs {
            return false;
        }
        *accumulated_secs = 0;
        if account.is_locked(now) {
            return true;
        }
        let until = now + Duration::seconds(self.params.cooldown_secs);
        account.cooldown_until = Some(until);
        info!(user = account.id.0, %until, "artifact tier overheated");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rim_core::{ItemId, UserId};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn engine(policy: TierPolicy) -> EconomyEngine {
        EconomyEngine::new(TierTable::standard(), policy, EconParams::default()).unwrap()
    }

    fn account() -> Account {
        Account::new(UserId(1), Decimal::ZERO, None)
    }

    #[test]
    fn rejects_bad_params() {
        let mut params = EconParams::default();
        params.load_factor_min = 1.5;
        assert_eq!(
            EconomyEngine::new(TierTable::standard(), TierPolicy::OwnershipGated, params)
                .unwrap_err(),
            EconError::InvalidParams("empty load factor range")
        );
    }

    #[test]
    fn balance_gated_tier_follows_thresholds() {
        let engine = engine(TierPolicy::BalanceGated);
        let mut acct = account();
        assert_eq!(engine.derive_tier(&acct).id, TierId(1));
        acct.balance = Decimal::from(1_000u32);
        assert_eq!(engine.derive_tier(&acct).id, TierId(2));
        acct.balance = Decimal::from(99_999u32);
        assert_eq!(engine.derive_tier(&acct).id, TierId(4));
        acct.balance = Decimal::from(2_000_000u32);
        assert_eq!(engine.derive_tier(&acct).id, TierId(7));
    }

    #[test]
    fn ownership_gated_tier_ignores_balance() {
        let engine = engine(TierPolicy::OwnershipGated);
        let mut acct = account();
        acct.balance = Decimal::from(10_000_000u32);
        assert_eq!(engine.derive_tier(&acct).id, TierId(1));
        acct.inventory.insert(ItemId("tier_3".to_string()));
        assert_eq!(engine.derive_tier(&acct).id, TierId(3));
    }

    #[test]
    fn acquiring_a_higher_rig_never_demotes() {
        let engine = engine(TierPolicy::OwnershipGated);
        let mut acct = account();
        let mut last = engine.derive_tier(&acct).id;
        for rig in ["tier_2", "tier_4", "tier_7"] {
            acct.inventory.insert(ItemId(rig.to_string()));
            let tier = engine.derive_tier(&acct).id;
            assert!(tier >= last);
            last = tier;
        }
        assert_eq!(last, TierId(7));
    }

    #[test]
    fn locked_multiplier_is_exactly_zero_for_all_tiers() {
        let engine = engine(TierPolicy::OwnershipGated);
        for tier in engine.table().iter() {
            for boosted in [false, true] {
                let mut acct = account();
                acct.cooldown_until = Some(at(1_000));
                if boosted {
                    acct.booster_expiry = Some(at(2_000));
                }
                assert_eq!(engine.effective_multiplier(&acct, tier, at(0)), 0.0);
            }
        }
    }

    #[test]
    fn booster_applies_while_unexpired() {
        let engine = engine(TierPolicy::OwnershipGated);
        let tier = engine.table().base().clone();
        let mut acct = account();
        acct.booster_expiry = Some(at(3_600));
        assert_eq!(engine.effective_multiplier(&acct, &tier, at(0)), 1.2);
        assert_eq!(engine.effective_multiplier(&acct, &tier, at(3_600)), 1.0);
    }

    #[test]
    fn referrals_are_capped_by_bandwidth() {
        let engine = engine(TierPolicy::OwnershipGated);
        let tier = engine.table().base().clone();
        let mut acct = account();
        acct.referral_count = 500;
        assert_eq!(engine.active_referrals(&acct, &tier), tier.bandwidth_cap);
        acct.referral_count = 3;
        assert_eq!(engine.active_referrals(&acct, &tier), 3);
    }

    #[test]
    fn boosted_base_tier_tick_matches_expected_delta() {
        // base_rate 0.1 * tier 1.0 * booster 1.2 * load 1.0 / 10 = 0.012
        let engine = engine(TierPolicy::OwnershipGated);
        let tier = engine.table().base().clone();
        let mut acct = account();
        acct.booster_expiry = Some(at(3_600));
        let delta = engine.compute_earnings(&acct, &tier, at(0), 1.0).unwrap();
        assert_eq!(delta, Decimal::new(12, 3));
    }

    #[test]
    fn botnet_doubles_only_the_referral_term() {
        let engine = engine(TierPolicy::OwnershipGated);
        let tier = engine.table().base().clone();
        let mut acct = account();
        acct.referral_count = 10;
        let plain = engine.compute_earnings(&acct, &tier, at(0), 1.0).unwrap();
        acct.botnet_expiry = Some(at(3_600));
        let injected = engine.compute_earnings(&acct, &tier, at(0), 1.0).unwrap();
        // mining term: 0.1 / 10 = 0.01; referral term: 10 * 0.003 = 0.03
        assert_eq!(plain, Decimal::new(40, 3));
        assert_eq!(injected, Decimal::new(70, 3));
    }

    #[test]
    fn locked_tick_earns_nothing_even_with_referrals() {
        let engine = engine(TierPolicy::OwnershipGated);
        let tier = engine.table().base().clone();
        let mut acct = account();
        acct.referral_count = 10;
        acct.botnet_expiry = Some(at(3_600));
        acct.cooldown_until = Some(at(3_600));
        let delta = engine.compute_earnings(&acct, &tier, at(0), 1.0).unwrap();
        assert_eq!(delta, Decimal::ZERO);
    }

    #[test]
    fn out_of_range_load_factor_is_rejected() {
        let engine = engine(TierPolicy::OwnershipGated);
        let tier = engine.table().base().clone();
        let acct = account();
        assert!(matches!(
            engine.compute_earnings(&acct, &tier, at(0), 1.5),
            Err(EconError::InvalidLoadFactor(_))
        ));
        assert!(matches!(
            engine.compute_earnings(&acct, &tier, at(0), f64::NAN),
            Err(EconError::InvalidLoadFactor(_))
        ));
    }

    #[test]
    fn load_factor_is_seeded_and_bounded() {
        let engine = engine(TierPolicy::OwnershipGated);
        let mut a = ChaCha8Rng::seed_from_u64(42);
        let mut b = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..100 {
            let x = engine.sample_load_factor(&mut a);
            assert_eq!(x, engine.sample_load_factor(&mut b));
            assert!((0.8..=1.0).contains(&x));
        }
    }

    #[test]
    fn artifact_usage_arms_cooldown_at_the_limit() {
        let engine = engine(TierPolicy::OwnershipGated);
        let mut acct = account();
        acct.inventory.insert(ItemId("tier_7".to_string()));
        let mut used = 0i64;
        let limit = engine.params().artifact_daily_limit_secs;
        assert!(!engine.advance_artifact_usage(&mut acct, &mut used, limit - 1, at(0)));
        assert!(acct.cooldown_until.is_none());
        assert!(engine.advance_artifact_usage(&mut acct, &mut used, 1, at(0)));
        assert_eq!(acct.cooldown_until, Some(at(0) + Duration::hours(20)));
        assert_eq!(used, 0);
    }

    #[test]
    fn retrigger_never_shortens_an_existing_lockout() {
        let engine = engine(TierPolicy::OwnershipGated);
        let mut acct = account();
        acct.inventory.insert(ItemId("tier_7".to_string()));
        let until = at(50_000);
        acct.cooldown_until = Some(until);
        let mut used = 0i64;
        let limit = engine.params().artifact_daily_limit_secs;
        assert!(engine.advance_artifact_usage(&mut acct, &mut used, limit, at(0)));
        assert_eq!(acct.cooldown_until, Some(until));
    }

    #[test]
    fn non_artifact_tiers_never_accumulate() {
        let engine = engine(TierPolicy::OwnershipGated);
        let mut acct = account();
        let mut used = 0i64;
        assert!(!engine.advance_artifact_usage(&mut acct, &mut used, 1_000_000, at(0)));
        assert_eq!(used, 0);
        assert!(acct.cooldown_until.is_none());
    }

    #[test]
    fn context_reflects_lockout_and_cap() {
        let engine = engine(TierPolicy::OwnershipGated);
        let mut acct = account();
        acct.referral_count = 99;
        acct.cooldown_until = Some(at(100));
        let ctx = engine.context(&acct, at(0));
        assert!(ctx.is_locked);
        assert_eq!(ctx.effective_multiplier, 0.0);
        assert_eq!(ctx.tier_id, TierId(1));
        assert_eq!(ctx.active_referrals, 10);
    }

    proptest! {
        #[test]
        fn multiplier_is_zero_whenever_locked(
            tier_idx in 0usize..7,
            boosted in any::<bool>(),
            lock_ahead in 1i64..1_000_000,
        ) {
            let engine = engine(TierPolicy::OwnershipGated);
            let tier = engine.table().iter().nth(tier_idx).unwrap().clone();
            let mut acct = account();
            acct.cooldown_until = Some(at(lock_ahead));
            if boosted {
                acct.booster_expiry = Some(at(lock_ahead));
            }
            prop_assert_eq!(engine.effective_multiplier(&acct, &tier, at(0)), 0.0);
            prop_assert_eq!(engine.compute_earnings(&acct, &tier, at(0), 1.0).unwrap(), Decimal::ZERO);
        }

        #[test]
        fn active_referrals_never_exceed_cap(count in 0u32..10_000, tier_idx in 0usize..7) {
            let engine = engine(TierPolicy::OwnershipGated);
            let tier = engine.table().iter().nth(tier_idx).unwrap().clone();
            let mut acct = account();
            acct.referral_count = count;
            prop_assert!(engine.active_referrals(&acct, &tier) <= tier.bandwidth_cap);
        }

        #[test]
        fn balance_gated_derivation_is_monotone(a in 0u32..3_000_000, b in 0u32..3_000_000) {
            let engine = engine(TierPolicy::BalanceGated);
            let (lo, hi) = (a.min(b), a.max(b));
            let mut acct = account();
            acct.balance = Decimal::from(lo);
            let t_lo = engine.derive_tier(&acct).id;
            acct.balance = Decimal::from(hi);
            let t_hi = engine.derive_tier(&acct).id;
            prop_assert!(t_hi >= t_lo);
        }

        #[test]
        fn earnings_are_rounded_to_three_places(load in 0.8f64..=1.0, refs in 0u32..100) {
            let engine = engine(TierPolicy::OwnershipGated);
            let tier = engine.table().base().clone();
            let mut acct = account();
            acct.referral_count = refs;
            let delta = engine.compute_earnings(&acct, &tier, at(0), load).unwrap();
            prop_assert!(delta >= Decimal::ZERO);
            prop_assert!(delta.scale() <= 3);
        }
    }
}
