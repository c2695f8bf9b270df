//! Copy-on-write view over per-address account state.
//!
//! An [`AccountStateDelta`] is handed to action code during evaluation. It
//! reads through to the chain state as of the previous block (via a lookup
//! closure supplied by the engine) and records every write locally, so the
//! output of one action becomes the input of the next without touching the
//! store.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ActionError, ChainError};
use crate::types::Address;

/// Resolves the state of an address as of the block being built upon.
///
/// Implemented by the engine; `Ok(None)` means the address has never been
/// touched.
pub type StateLookup<'a> = &'a dyn Fn(&Address) -> Result<Option<AccountState>, ChainError>;

/// Persisted per-address record inside a block-state delta.
///
/// `value` is the opaque state assigned by action code; `balances` are the
/// fungible asset amounts keyed by currency ticker. The store treats the
/// whole record as opaque bytes.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    /// Opaque action-defined state, if any was ever set.
    pub value: Option<Value>,
    /// Fungible balances held by the address.
    pub balances: BTreeMap<String, u64>,
}

impl AccountState {
    /// Convenience constructor for a record carrying only a state value.
    pub fn with_value(value: Value) -> Self {
        AccountState {
            value: Some(value),
            balances: BTreeMap::new(),
        }
    }

    /// Returns the balance of `currency`, zero when absent.
    pub fn balance(&self, currency: &str) -> u64 {
        self.balances.get(currency).copied().unwrap_or(0)
    }
}

/// Mutable state view passed to [`Action::execute`](crate::action::Action::execute).
pub struct AccountStateDelta<'a> {
    base: StateLookup<'a>,
    updated: BTreeMap<Address, AccountState>,
    state_updated: BTreeSet<Address>,
}

impl<'a> AccountStateDelta<'a> {
    pub(crate) fn new(base: StateLookup<'a>) -> Self {
        AccountStateDelta {
            base,
            updated: BTreeMap::new(),
            state_updated: BTreeSet::new(),
        }
    }

    fn account(&self, address: &Address) -> Result<AccountState, ActionError> {
        if let Some(state) = self.updated.get(address) {
            return Ok(state.clone());
        }
        match (self.base)(address) {
            Ok(found) => Ok(found.unwrap_or_default()),
            Err(e) => Err(ActionError::State(Box::new(e))),
        }
    }

    /// Returns the opaque state of `address`, if any.
    pub fn get_state(&self, address: &Address) -> Result<Option<Value>, ActionError> {
        Ok(self.account(address)?.value)
    }

    /// Assigns the opaque state of `address`.
    pub fn set_state(&mut self, address: Address, value: Value) -> Result<(), ActionError> {
        let mut account = self.account(&address)?;
        account.value = Some(value);
        self.updated.insert(address, account);
        self.state_updated.insert(address);
        Ok(())
    }

    /// Returns the balance of `currency` held by `address`.
    pub fn get_balance(&self, address: &Address, currency: &str) -> Result<u64, ActionError> {
        Ok(self.account(address)?.balance(currency))
    }

    /// Creates `amount` units of `currency` out of thin air for `address`.
    pub fn mint_asset(
        &mut self,
        address: Address,
        currency: &str,
        amount: u64,
    ) -> Result<(), ActionError> {
        if amount == 0 {
            return Err(ActionError::Failed("mint amount must be positive".into()));
        }
        let mut account = self.account(&address)?;
        let balance = account.balance(currency);
        let next = balance.checked_add(amount).ok_or(ActionError::BalanceOverflow {
            address,
            currency: currency.to_string(),
        })?;
        account.balances.insert(currency.to_string(), next);
        self.updated.insert(address, account);
        Ok(())
    }

    /// Destroys `amount` units of `currency` held by `address`.
    pub fn burn_asset(
        &mut self,
        address: Address,
        currency: &str,
        amount: u64,
    ) -> Result<(), ActionError> {
        if amount == 0 {
            return Err(ActionError::Failed("burn amount must be positive".into()));
        }
        let mut account = self.account(&address)?;
        let balance = account.balance(currency);
        if balance < amount {
            return Err(ActionError::InsufficientBalance {
                address,
                currency: currency.to_string(),
                balance,
                amount,
            });
        }
        account.balances.insert(currency.to_string(), balance - amount);
        self.updated.insert(address, account);
        Ok(())
    }

    /// Moves `amount` units of `currency` from `from` to `to`.
    ///
    /// Both sides are checked before either account is written, so a
    /// failing transfer leaves the delta untouched.
    pub fn transfer_asset(
        &mut self,
        from: Address,
        to: Address,
        currency: &str,
        amount: u64,
    ) -> Result<(), ActionError> {
        if amount == 0 {
            return Err(ActionError::Failed("transfer amount must be positive".into()));
        }
        let mut sender = self.account(&from)?;
        let sender_balance = sender.balance(currency);
        if sender_balance < amount {
            return Err(ActionError::InsufficientBalance {
                address: from,
                currency: currency.to_string(),
                balance: sender_balance,
                amount,
            });
        }
        if from == to {
            // A self-transfer is a no-op once the balance check passed.
            return Ok(());
        }
        let mut receiver = self.account(&to)?;
        let receiver_next = receiver
            .balance(currency)
            .checked_add(amount)
            .ok_or(ActionError::BalanceOverflow {
                address: to,
                currency: currency.to_string(),
            })?;
        sender
            .balances
            .insert(currency.to_string(), sender_balance - amount);
        receiver.balances.insert(currency.to_string(), receiver_next);
        self.updated.insert(from, sender);
        self.updated.insert(to, receiver);
        Ok(())
    }

    /// Every address whose record this delta touched.
    pub fn updated_addresses(&self) -> BTreeSet<Address> {
        self.updated.keys().copied().collect()
    }

    /// Addresses whose opaque state (not merely a balance) was assigned.
    pub fn state_updated_addresses(&self) -> &BTreeSet<Address> {
        &self.state_updated
    }

    pub(crate) fn into_updates(self) -> BTreeMap<Address, AccountState> {
        self.updated
    }
}
