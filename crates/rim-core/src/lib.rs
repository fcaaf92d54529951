#![deny(warnings)]

//! Core domain models and invariants for the RIM grid economy.
//!
//! This crate defines the serializable types shared by the engine, session,
//! and store crates, together with validation helpers that guarantee the
//! basic invariants: ordered tier ladders, non-negative balances, and the
//! stacking rule for consumable expiries.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;

/// Unique identifier for an end user (one account row per user).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Ordered tier rank; higher means a better multiplier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TierId(pub u8);

/// Identifier for a marketplace item, e.g. "tier_3" or "signal_booster".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemId(pub String);

/// Time-limited purchased effects; each maps to one expiry field on the account.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Buff {
    /// Keeps accrual alive server-side while the client is away.
    Relay,
    /// Yield multiplier bonus while unexpired.
    Booster,
    /// Doubles the referral term while unexpired.
    Botnet,
}

/// A reward tier: multiplier level plus referral bandwidth.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tier {
    /// Rank within the ladder; tiers are totally ordered by this.
    pub id: TierId,
    /// Display name, e.g. "VAMPIRE".
    pub name: String,
    /// Minimum cumulative balance (balance-gated policy only).
    pub threshold: Decimal,
    /// Earnings multiplier, >= 1.0.
    pub multiplier: f64,
    /// Maximum number of referrals that count toward earnings.
    pub bandwidth_cap: u32,
    /// Rig that unlocks this tier (ownership-gated policy); `None` for the base tier.
    pub unlock_rig: Option<ItemId>,
    /// Whether sustained use of this tier triggers the overheat lockout.
    pub artifact: bool,
}

/// Validated, ordered ladder of tiers.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TierTable {
    tiers: Vec<Tier>,
}

impl TierTable {
    /// Build a table from an ascending list of tiers, rejecting malformed ladders.
    pub fn new(tiers: Vec<Tier>) -> Result<Self, ValidationError> {
        let table = TierTable { tiers };
        validate_tier_table(&table)?;
        Ok(table)
    }

    /// The production ladder shipped with the app.
    pub fn standard() -> Self {
        let tier = |id: u8, name: &str, threshold: u32, multiplier: f64, cap: u32, artifact| Tier {
            id: TierId(id),
            name: name.to_string(),
            threshold: Decimal::from(threshold),
            multiplier,
            bandwidth_cap: cap,
            unlock_rig: if id == 1 {
                None
            } else {
                Some(ItemId(format!("tier_{id}")))
            },
            artifact,
        };
        TierTable {
            tiers: vec![
                tier(1, "SCOUT NODE", 0, 1.0, 10, false),
                tier(2, "HIGH-FLYER", 1_000, 1.2, 25, false),
                tier(3, "VAMPIRE", 5_000, 1.5, 50, false),
                tier(4, "DIVER DOLPHIN", 20_000, 2.0, 100, false),
                tier(5, "SURFER DOLPHIN", 100_000, 3.0, 250, false),
                tier(6, "SUPER-ALLIANCE", 500_000, 5.0, 500, false),
                tier(7, "APEX MK1", 1_500_000, 10.0, 1_000, true),
            ],
        }
    }

    /// The base tier every account starts in.
    pub fn base(&self) -> &Tier {
        // Non-emptiness is a construction invariant.
        &self.tiers[0]
    }

    /// Look up a tier by rank.
    pub fn get(&self, id: TierId) -> Option<&Tier> {
        self.tiers.iter().find(|t| t.id == id)
    }

    /// Tiers in ascending rank order.
    pub fn iter(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter()
    }

    /// Tiers from highest rank to lowest, the order tier derivation scans in.
    pub fn ranked_desc(&self) -> impl Iterator<Item = &Tier> {
        self.tiers.iter().rev()
    }
}

/// One row per end user in the remote store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Owner of the row.
    pub id: UserId,
    /// Accrued currency; never decreases except through a validated purchase.
    pub balance: Decimal,
    /// Permanently owned rigs.
    pub inventory: BTreeSet<ItemId>,
    /// Relay consumable expiry, if ever purchased.
    pub relay_expiry: Option<DateTime<Utc>>,
    /// Booster consumable expiry, if ever purchased.
    pub booster_expiry: Option<DateTime<Utc>>,
    /// Botnet consumable expiry, if ever purchased.
    pub botnet_expiry: Option<DateTime<Utc>>,
    /// End of the overheat lockout; binding across session restarts.
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Total referrals credited to this user (uncapped).
    pub referral_count: u32,
    /// Who referred this user, from the `ref_<id>` deep link.
    pub referred_by: Option<UserId>,
}

impl Account {
    /// Fresh account created on first contact.
    pub fn new(id: UserId, initial_balance: Decimal, referred_by: Option<UserId>) -> Self {
        Account {
            id,
            balance: initial_balance,
            inventory: BTreeSet::new(),
            relay_expiry: None,
            booster_expiry: None,
            botnet_expiry: None,
            cooldown_until: None,
            referral_count: 0,
            referred_by,
        }
    }

    /// True while an overheat cooldown is pending. Evaluated fresh on every
    /// call; this is the sole gate suppressing earnings during lockout.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.cooldown_until, Some(until) if until > now)
    }

    /// Current expiry of a buff, if any.
    pub fn buff_expiry(&self, buff: Buff) -> Option<DateTime<Utc>> {
        match buff {
            Buff::Relay => self.relay_expiry,
            Buff::Booster => self.booster_expiry,
            Buff::Botnet => self.botnet_expiry,
        }
    }

    /// Whether a buff is unexpired at `now`.
    pub fn buff_active(&self, buff: Buff, now: DateTime<Utc>) -> bool {
        matches!(self.buff_expiry(buff), Some(expiry) if expiry > now)
    }

    /// Overwrite a buff expiry field.
    pub fn set_buff_expiry(&mut self, buff: Buff, expiry: Option<DateTime<Utc>>) {
        match buff {
            Buff::Relay => self.relay_expiry = expiry,
            Buff::Booster => self.booster_expiry = expiry,
            Buff::Botnet => self.botnet_expiry = expiry,
        }
    }
}

/// Expiry produced by stacking a new consumable purchase on an existing one.
///
/// Extends from `max(now, current)` so remaining time is never wasted: buying
/// the same consumable twice yields the sum of both durations.
pub fn stacked_expiry(
    current: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    duration_secs: i64,
) -> DateTime<Utc> {
    let base = current.map_or(now, |expiry| expiry.max(now));
    base + Duration::seconds(duration_secs)
}

/// Parse a referral deep-link token of the form `ref_<id>`.
///
/// Malformed tokens are silently ignored (returns `None`).
pub fn parse_referral_token(token: &str) -> Option<UserId> {
    token
        .strip_prefix("ref_")
        .and_then(|raw| raw.parse::<i64>().ok())
        .map(UserId)
}

/// What purchasing an item does to the account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ItemEffect {
    /// Permanently unlocks a tier (the item id lands in the inventory).
    UnlockTier(TierId),
    /// Extends a buff expiry by a fixed duration, stacking on remaining time.
    ExtendBuff {
        /// Which expiry field the purchase extends.
        buff: Buff,
        /// Duration added per purchase, in seconds.
        duration_secs: i64,
    },
}

/// A purchasable marketplace entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Stable identifier, also used as the inventory key for rigs.
    pub id: ItemId,
    /// Display name.
    pub name: String,
    /// Debit applied on purchase.
    pub price: Decimal,
    /// Effect applied together with the debit.
    pub effect: ItemEffect,
}

impl CatalogItem {
    /// Rigs are permanent and can be owned at most once.
    pub fn is_rig(&self) -> bool {
        matches!(self.effect, ItemEffect::UnlockTier(_))
    }
}

/// The marketplace listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ItemCatalog {
    items: Vec<CatalogItem>,
}

impl ItemCatalog {
    /// The production marketplace: three consumables plus the rig ladder.
    pub fn standard() -> Self {
        let consumable = |id: &str, name: &str, price: u32, buff, hours: i64| CatalogItem {
            id: ItemId(id.to_string()),
            name: name.to_string(),
            price: Decimal::from(price),
            effect: ItemEffect::ExtendBuff {
                buff,
                duration_secs: hours * 3_600,
            },
        };
        let rig = |tier: u8, name: &str, price: u32| CatalogItem {
            id: ItemId(format!("tier_{tier}")),
            name: name.to_string(),
            price: Decimal::from(price),
            effect: ItemEffect::UnlockTier(TierId(tier)),
        };
        ItemCatalog {
            items: vec![
                consumable("cloud_relay", "CLOUD RELAY (24h)", 500, Buff::Relay, 24),
                consumable("signal_booster", "SIGNAL BOOSTER", 2_000, Buff::Booster, 1),
                consumable("botnet_injection", "BOTNET INJECTION", 3_500, Buff::Botnet, 1),
                rig(2, "HIGH-FLYER NFT", 1_000),
                rig(3, "VAMPIRE NFT", 5_000),
                rig(4, "DIVER DOLPHIN", 20_000),
                rig(5, "SURFER DOLPHIN", 100_000),
                rig(6, "SUPER-ALLIANCE", 500_000),
                rig(7, "APEX MK1", 1_500_000),
            ],
        }
    }

    /// Look up an item by id.
    pub fn get(&self, id: &ItemId) -> Option<&CatalogItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    /// All items in listing order.
    pub fn iter(&self) -> impl Iterator<Item = &CatalogItem> {
        self.items.iter()
    }
}

/// Validation errors for domain invariants.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    /// The ladder must contain at least the base tier.
    #[error("tier table is empty")]
    EmptyTierTable,
    /// Tier ids must be strictly increasing.
    #[error("tier ids out of order at rank {0}")]
    TierOrder(u8),
    /// Thresholds must be monotonically non-decreasing across the ladder.
    #[error("tier threshold decreases at rank {0}")]
    ThresholdOrder(u8),
    /// The base tier must be free: zero threshold and no rig requirement.
    #[error("base tier must have zero threshold and no unlock rig")]
    BaseTierNotFree,
    /// Only the top tier may be flagged as the overheat-prone artifact.
    #[error("artifact flag on a non-top tier")]
    ArtifactNotTop,
    /// Multipliers must be finite and >= 1.0.
    #[error("invalid multiplier on tier {0}")]
    InvalidMultiplier(u8),
    /// Names must be non-empty.
    #[error("empty tier name at rank {0}")]
    EmptyName(u8),
    /// Two tiers claim the same unlock rig.
    #[error("duplicate unlock rig: {0}")]
    DuplicateRig(String),
    /// Balances must be non-negative.
    #[error("negative balance")]
    NegativeBalance,
}

/// Validate a single tier in isolation.
pub fn validate_tier(tier: &Tier) -> Result<(), ValidationError> {
    if !tier.multiplier.is_finite() || tier.multiplier < 1.0 {
        return Err(ValidationError::InvalidMultiplier(tier.id.0));
    }
    if tier.name.trim().is_empty() {
        return Err(ValidationError::EmptyName(tier.id.0));
    }
    Ok(())
}

/// Validate a full ladder, including ordering and artifact placement.
pub fn validate_tier_table(table: &TierTable) -> Result<(), ValidationError> {
    let tiers = &table.tiers;
    let Some(base) = tiers.first() else {
        return Err(ValidationError::EmptyTierTable);
    };
    if base.threshold != Decimal::ZERO || base.unlock_rig.is_some() {
        return Err(ValidationError::BaseTierNotFree);
    }
    let mut rigs: BTreeSet<&ItemId> = BTreeSet::new();
    for (i, tier) in tiers.iter().enumerate() {
        validate_tier(tier)?;
        if i > 0 {
            let prev = &tiers[i - 1];
            if tier.id <= prev.id {
                return Err(ValidationError::TierOrder(tier.id.0));
            }
            if tier.threshold < prev.threshold {
                return Err(ValidationError::ThresholdOrder(tier.id.0));
            }
        }
        if tier.artifact && i + 1 != tiers.len() {
            return Err(ValidationError::ArtifactNotTop);
        }
        if let Some(rig) = &tier.unlock_rig {
            if !rigs.insert(rig) {
                return Err(ValidationError::DuplicateRig(rig.0.clone()));
            }
        }
    }
    Ok(())
}

/// Validate account-level invariants.
pub fn validate_account(account: &Account) -> Result<(), ValidationError> {
    if account.balance < Decimal::ZERO {
        return Err(ValidationError::NegativeBalance);
    }
    Ok(())
}
