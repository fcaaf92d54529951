#![deny(warnings)]

//! Session orchestration: the earning state machine, the purchase path, and
//! the periodic flush/reconcile cycle against the account store.
//!
//! The controller is the sole mutator of the in-memory balance, so tick
//! credits and purchase debits are serialized by construction (`&mut self`).
//! Flush and reconcile are best-effort: their failures are logged and
//! swallowed, and the next cycle retries naturally by re-sending current
//! state. Only the purchase path blocks its mutation on a confirmed write.

use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rim_core::{stacked_expiry, Account, CatalogItem, ItemEffect, ItemId, UserId};
use rim_econ::{EarningContext, EconError, EconomyEngine};
use rim_store::{AccountPatch, AccountStore, StoreError};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The per-session earning state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Not earning; toggling starts a session unless locked.
    Idle,
    /// The periodic tick accrues balance.
    Earning,
    /// Overheat lockout pending; cleared lazily once the cooldown elapses.
    Overheated,
}

/// Toggle rejections surfaced to the user.
#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    /// Earning cannot start while an overheat cooldown is pending.
    #[error("earning locked until {until}")]
    LockedOut {
        /// When the lockout expires.
        until: DateTime<Utc>,
    },
}

/// Purchase rejections; all recoverable and user-facing.
#[derive(Debug, Error, PartialEq)]
pub enum PurchaseError {
    /// The account cannot afford the item.
    #[error("insufficient funds: balance {balance}, price {price}")]
    InsufficientFunds {
        /// Balance at the time of the attempt.
        balance: Decimal,
        /// Price of the rejected item.
        price: Decimal,
    },
    /// Rigs are permanent and can be owned at most once.
    #[error("rig {0:?} already owned")]
    AlreadyOwned(ItemId),
    /// The confirming write failed; no in-memory state was changed.
    #[error(transparent)]
    Persistence(#[from] StoreError),
}

// Absolute divergence beyond which reconcile snaps to the persisted balance.
fn drift_threshold() -> Decimal {
    Decimal::new(5, 0)
}

/// Owns one account for the duration of a session: starts/stops earning,
/// applies tick deltas, and mediates purchases against the store.
#[derive(Debug)]
pub struct SessionController {
    engine: EconomyEngine,
    account: Account,
    state: SessionState,
    artifact_secs: i64,
    rng: ChaCha8Rng,
}

impl SessionController {
    /// Fetch-or-create the account row and rehydrate the lockout state.
    ///
    /// A persisted cooldown still in the future puts the session straight
    /// into [`SessionState::Overheated`]; in-memory restarts never escape it.
    pub fn load<S: AccountStore>(
        store: &S,
        user_id: UserId,
        initial_balance: Decimal,
        referred_by: Option<UserId>,
        engine: EconomyEngine,
        seed: u64,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let account = match store.fetch(user_id)? {
            Some(account) => account,
            None => store.create(user_id, initial_balance, referred_by)?,
        };
        let state = if account.is_locked(now) {
            SessionState::Overheated
        } else {
            SessionState::Idle
        };
        debug!(user = user_id.0, ?state, "session loaded");
        Ok(SessionController {
            engine,
            account,
            state,
            artifact_secs: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    /// Current state of the earning state machine.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The in-memory account this session owns.
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// The engine driving this session.
    pub fn engine(&self) -> &EconomyEngine {
        &self.engine
    }

    /// Per-tick earning snapshot for display.
    pub fn context(&self, now: DateTime<Utc>) -> EarningContext {
        self.engine.context(&self.account, now)
    }

    fn clear_expired_lockout(&mut self, now: DateTime<Utc>) {
        if self.state == SessionState::Overheated && !self.account.is_locked(now) {
            self.state = SessionState::Idle;
            self.account.cooldown_until = None;
            debug!(user = self.account.id.0, "cooldown elapsed, lockout cleared");
        }
    }

    /// User-initiated start/stop. Rejected without a state change while a
    /// cooldown is pending; the caller surfaces the rejection as a warning.
    pub fn toggle(&mut self, now: DateTime<Utc>) -> Result<SessionState, SessionError> {
        self.clear_expired_lockout(now);
        if let Some(until) = self.account.cooldown_until {
            if until > now {
                return Err(SessionError::LockedOut { until });
            }
        }
        self.state = match self.state {
            SessionState::Earning => SessionState::Idle,
            SessionState::Idle | SessionState::Overheated => SessionState::Earning,
        };
        info!(user = self.account.id.0, state = ?self.state, "session toggled");
        Ok(self.state)
    }

    /// One earning tick: sample the load factor, apply the delta, and advance
    /// artifact usage. `elapsed_secs` is the active time since the last tick.
    ///
    /// Outside [`SessionState::Earning`] this is a no-op returning zero; an
    /// expired lockout is cleared lazily here, without a dedicated timer.
    pub fn tick(&mut self, now: DateTime<Utc>, elapsed_secs: i64) -> Result<Decimal, EconError> {
        self.clear_expired_lockout(now);
        if self.state != SessionState::Earning {
            return Ok(Decimal::ZERO);
        }
        let load_factor = self.engine.sample_load_factor(&mut self.rng);
        let tier = self.engine.derive_tier(&self.account);
        let delta = self
            .engine
            .compute_earnings(&self.account, tier, now, load_factor)?;
        self.account.balance += delta;
        if self
            .engine
            .advance_artifact_usage(&mut self.account, &mut self.artifact_secs, elapsed_secs, now)
        {
            self.state = SessionState::Overheated;
            warn!(user = self.account.id.0, "session overheated, earning suspended");
        }
        Ok(delta)
    }

    /// Best-effort periodic write of the tick-owned columns. Failures are
    /// logged and swallowed; the next flush re-sends current state.
    pub fn flush<S: AccountStore>(&self, store: &S) {
        let patch = AccountPatch::default()
            .balance(self.account.balance)
            .cooldown_until(self.account.cooldown_until);
        if let Err(err) = store.update(self.account.id, &patch) {
            warn!(user = self.account.id.0, %err, "flush failed, retrying next cycle");
        }
    }

    /// Anti-drift safeguard: snap the in-memory balance to the persisted
    /// value when the absolute divergence exceeds a fixed threshold, and
    /// adopt a later persisted cooldown. Read failures are swallowed.
    pub fn reconcile<S: AccountStore>(&mut self, store: &S) {
        let remote = match store.fetch(self.account.id) {
            Ok(Some(remote)) => remote,
            Ok(None) => {
                warn!(user = self.account.id.0, "reconcile found no persisted row");
                return;
            }
            Err(err) => {
                debug!(user = self.account.id.0, %err, "reconcile read failed");
                return;
            }
        };
        let drift = (remote.balance - self.account.balance).abs();
        if drift > drift_threshold() {
            info!(
                user = self.account.id.0,
                %drift,
                "balance drift beyond threshold, snapping to persisted value"
            );
            self.account.balance = remote.balance;
        }
        if remote.cooldown_until > self.account.cooldown_until {
            self.account.cooldown_until = remote.cooldown_until;
        }
    }

    /// Validate and commit a purchase atomically: the debit and the effect
    /// are written to the store first, and applied in memory only after the
    /// write succeeds. A failed write leaves the session untouched.
    pub fn purchase<S: AccountStore>(
        &mut self,
        store: &S,
        item: &CatalogItem,
        now: DateTime<Utc>,
    ) -> Result<(), PurchaseError> {
        if self.account.balance < item.price {
            return Err(PurchaseError::InsufficientFunds {
                balance: self.account.balance,
                price: item.price,
            });
        }
        let new_balance = self.account.balance - item.price;
        match &item.effect {
            ItemEffect::UnlockTier(_) => {
                if self.account.inventory.contains(&item.id) {
                    return Err(PurchaseError::AlreadyOwned(item.id.clone()));
                }
                let mut inventory = self.account.inventory.clone();
                inventory.insert(item.id.clone());
                let patch = AccountPatch::default()
                    .balance(new_balance)
                    .inventory(inventory.clone());
                store.update(self.account.id, &patch)?;
                self.account.balance = new_balance;
                self.account.inventory = inventory;
            }
            ItemEffect::ExtendBuff {
                buff,
                duration_secs,
            } => {
                let expiry = stacked_expiry(self.account.buff_expiry(*buff), now, *duration_secs);
                let patch = AccountPatch::default()
                    .balance(new_balance)
                    .buff_expiry(*buff, Some(expiry));
                store.update(self.account.id, &patch)?;
                self.account.balance = new_balance;
                self.account.set_buff_expiry(*buff, Some(expiry));
            }
        }
        info!(user = self.account.id.0, item = %item.id.0, "purchase committed");
        Ok(())
    }
}

/// One sample of the simulated rig telemetry shown next to the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RigTelemetry {
    /// Simulated NPU load percentage, always in [80, 99].
    pub npu_load_pct: u8,
    /// One line for the scrolling activity log.
    pub log_line: &'static str,
}

/// Lines cycled through the cosmetic activity log.
pub const TELEMETRY_LOG_LINES: [&str; 5] = [
    "Hash Verified",
    "NPU Optimized",
    "Packet Sent",
    "Uplink Stable",
    "Neural Sync Complete",
];

/// Cosmetic hardware/log simulation: a pure function of an RNG draw,
/// deliberately decoupled from the economic tick.
pub fn sample_rig_telemetry<R: Rng>(rng: &mut R) -> RigTelemetry {
    RigTelemetry {
        npu_load_pct: rng.gen_range(80..=99),
        log_line: TELEMETRY_LOG_LINES[rng.gen_range(0..TELEMETRY_LOG_LINES.len())],
    }
}
