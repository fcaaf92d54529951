#![deny(warnings)]

//! Account persistence contract and the in-memory reference store.
//!
//! The engine reads and writes plain account rows through [`AccountStore`].
//! Updates are partial: only fields present in an [`AccountPatch`] change, so
//! periodic flushes never clobber columns another writer owns.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rim_core::{Account, Buff, ItemId, UserId};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by an account store.
#[derive(Debug, Error, PartialEq)]
pub enum StoreError {
    /// No row exists for the user.
    #[error("account {0:?} not found")]
    NotFound(UserId),
    /// A row already exists for the user.
    #[error("account {0:?} already exists")]
    AlreadyExists(UserId),
    /// The backend could not be reached; callers on the periodic paths log
    /// and retry naturally on the next cycle.
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

/// A partial update to one account row. Absent fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AccountPatch {
    balance: Option<Decimal>,
    inventory: Option<BTreeSet<ItemId>>,
    relay_expiry: Option<Option<DateTime<Utc>>>,
    booster_expiry: Option<Option<DateTime<Utc>>>,
    botnet_expiry: Option<Option<DateTime<Utc>>>,
    cooldown_until: Option<Option<DateTime<Utc>>>,
    referral_count: Option<u32>,
}

impl AccountPatch {
    /// Set the persisted balance.
    pub fn balance(mut self, balance: Decimal) -> Self {
        self.balance = Some(balance);
        self
    }

    /// Replace the owned-rig set.
    pub fn inventory(mut self, inventory: BTreeSet<ItemId>) -> Self {
        self.inventory = Some(inventory);
        self
    }

    /// Set one buff expiry column.
    pub fn buff_expiry(mut self, buff: Buff, expiry: Option<DateTime<Utc>>) -> Self {
        match buff {
            Buff::Relay => self.relay_expiry = Some(expiry),
            Buff::Booster => self.booster_expiry = Some(expiry),
            Buff::Botnet => self.botnet_expiry = Some(expiry),
        }
        self
    }

    /// Set the cooldown deadline column.
    pub fn cooldown_until(mut self, until: Option<DateTime<Utc>>) -> Self {
        self.cooldown_until = Some(until);
        self
    }

    /// Set the referral counter.
    pub fn referral_count(mut self, count: u32) -> Self {
        self.referral_count = Some(count);
        self
    }

    /// True when the patch would change nothing.
    pub fn is_empty(&self) -> bool {
        self == &AccountPatch::default()
    }

    /// Apply the present fields to a row, leaving the rest untouched.
    pub fn apply(&self, account: &mut Account) {
        if let Some(balance) = self.balance {
            account.balance = balance;
        }
        if let Some(inventory) = &self.inventory {
            account.inventory = inventory.clone();
        }
        if let Some(expiry) = self.relay_expiry {
            account.relay_expiry = expiry;
        }
        if let Some(expiry) = self.booster_expiry {
            account.booster_expiry = expiry;
        }
        if let Some(expiry) = self.botnet_expiry {
            account.botnet_expiry = expiry;
        }
        if let Some(until) = self.cooldown_until {
            account.cooldown_until = until;
        }
        if let Some(count) = self.referral_count {
            account.referral_count = count;
        }
    }
}

/// Remote row-per-user persistence, one row per account.
pub trait AccountStore {
    /// Read a row, `Ok(None)` when the user has never been seen.
    fn fetch(&self, id: UserId) -> Result<Option<Account>, StoreError>;

    /// Create the row on first contact.
    fn create(
        &self,
        id: UserId,
        initial_balance: Decimal,
        referred_by: Option<UserId>,
    ) -> Result<Account, StoreError>;

    /// Apply a partial update without clobbering untouched fields.
    fn update(&self, id: UserId, patch: &AccountPatch) -> Result<(), StoreError>;
}

/// In-memory reference implementation, also the test double.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<UserId, Account>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Number of rows, for tests and diagnostics.
    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    /// True when no rows exist.
    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl AccountStore for MemoryStore {
    fn fetch(&self, id: UserId) -> Result<Option<Account>, StoreError> {
        Ok(self.rows.lock().get(&id).cloned())
    }

    fn create(
        &self,
        id: UserId,
        initial_balance: Decimal,
        referred_by: Option<UserId>,
    ) -> Result<Account, StoreError> {
        let mut rows = self.rows.lock();
        if rows.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        let account = Account::new(id, initial_balance, referred_by);
        rows.insert(id, account.clone());
        debug!(user = id.0, "created account row");
        Ok(account)
    }

    fn update(&self, id: UserId, patch: &AccountPatch) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        patch.apply(row);
        Ok(())
    }
}
