use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{AccountStore, DebitOutcome, OrderLedger, OrderStore, StoreError};
use crate::domain::order::{NewOrder, Order, OrderStatus};
use crate::domain::{Account, AccountId};

// ============================================================================
// In-Memory Store
// ============================================================================
//
// Implements all three storage traits behind a single mutex, so every
// operation (the ledger included) is one critical section. Used by tests and
// local runs without Postgres. `set_available(false)` makes every call fail
// with `Unavailable`.
//
// ============================================================================

#[derive(Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    orders: HashMap<Uuid, Order>,
    idempotency_keys: HashMap<String, Uuid>,
}

pub struct InMemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    pub async fn seed_account(&self, id: impl Into<String>, balance: Decimal) -> Account {
        let account = Account {
            id: AccountId::new(id),
            balance,
            updated_at: Utc::now(),
        };
        let mut state = self.state.lock().await;
        state.accounts.insert(account.id.clone(), account.clone());
        account
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn orders_for(&self, account_id: &AccountId) -> Vec<Order> {
        let state = self.state.lock().await;
        let mut orders: Vec<Order> = state
            .orders
            .values()
            .filter(|o| &o.account_id == account_id)
            .cloned()
            .collect();
        orders.sort_by_key(|o| o.created_at);
        orders
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }
}

impl State {
    fn insert_pending(&mut self, new_order: NewOrder) -> Result<Order, StoreError> {
        if !self.accounts.contains_key(&new_order.account_id) {
            return Err(StoreError::AccountNotFound(new_order.account_id));
        }
        if let Some(key) = &new_order.idempotency_key {
            if self.idempotency_keys.contains_key(key) {
                return Err(StoreError::IdempotencyKeyReused { key: key.clone() });
            }
        }

        let now = Utc::now();
        let order = Order {
            id: Uuid::now_v7(),
            account_id: new_order.account_id,
            total: new_order.total,
            status: OrderStatus::Pending,
            idempotency_key: new_order.idempotency_key,
            publish_attempts: 0,
            created_at: now,
            updated_at: now,
        };

        if let Some(key) = &order.idempotency_key {
            self.idempotency_keys.insert(key.clone(), order.id);
        }
        self.orders.insert(order.id, order.clone());
        Ok(order)
    }

    fn debit(&mut self, id: &AccountId, amount: Decimal) -> Result<Account, StoreError> {
        let account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::AccountNotFound(id.clone()))?;

        if !account.can_cover(amount) {
            return Err(StoreError::InsufficientFunds {
                account_id: id.clone(),
                balance: account.balance,
                requested: amount,
            });
        }

        account.balance -= amount;
        account.updated_at = Utc::now();
        Ok(account.clone())
    }

    fn advance(&mut self, id: Uuid, from: OrderStatus, to: OrderStatus) -> Result<Order, StoreError> {
        let order = self.orders.get_mut(&id).ok_or(StoreError::OrderNotFound(id))?;

        if order.status != from || !from.can_advance_to(to) {
            return Err(StoreError::Conflict {
                order_id: id,
                expected: from,
                actual: order.status,
            });
        }

        order.status = to;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }
}

#[async_trait]
impl AccountStore for InMemoryStore {
    async fn get_account(&self, id: &AccountId) -> Result<Account, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        state
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::AccountNotFound(id.clone()))
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut accounts: Vec<Account> = state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(accounts)
    }

    async fn conditional_debit(&self, id: &AccountId, amount: Decimal) -> Result<Account, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.debit(id, amount)
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn insert_order(&self, new_order: NewOrder) -> Result<Order, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.insert_pending(new_order)
    }

    async fn get_order(&self, id: Uuid) -> Result<Order, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        state.orders.get(&id).cloned().ok_or(StoreError::OrderNotFound(id))
    }

    async fn advance_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Order, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        state.advance(id, from, to)
    }

    async fn record_publish_failure(&self, id: Uuid) -> Result<i32, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let order = state.orders.get_mut(&id).ok_or(StoreError::OrderNotFound(id))?;
        order.publish_attempts += 1;
        order.updated_at = Utc::now();
        Ok(order.publish_attempts)
    }

    async fn list_stalled(
        &self,
        status: OrderStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut stalled: Vec<Order> = state
            .orders
            .values()
            .filter(|o| o.status == status && o.updated_at <= older_than)
            .cloned()
            .collect();
        stalled.sort_by_key(|o| o.created_at);
        stalled.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(stalled)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[async_trait]
impl OrderLedger for InMemoryStore {
    async fn commit_debit(&self, new_order: NewOrder) -> Result<DebitOutcome, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;

        let balance = state
            .accounts
            .get(&new_order.account_id)
            .map(|a| a.balance)
            .ok_or_else(|| StoreError::AccountNotFound(new_order.account_id.clone()))?;

        if let Some(key) = &new_order.idempotency_key {
            if let Some(existing) = state.idempotency_keys.get(key).and_then(|id| state.orders.get(id)) {
                if !new_order.matches(existing) {
                    return Err(StoreError::IdempotencyKeyReused { key: key.clone() });
                }
                return Ok(DebitOutcome::Duplicate(existing.clone()));
            }
        }

        if balance < new_order.total {
            return Err(StoreError::InsufficientFunds {
                account_id: new_order.account_id,
                balance,
                requested: new_order.total,
            });
        }

        // Nothing below can fail once the checks above passed, so there is
        // no partial state to roll back.
        let amount = new_order.total;
        let account_id = new_order.account_id.clone();
        let pending = state.insert_pending(new_order)?;
        state.debit(&account_id, amount)?;
        let order = state.advance(pending.id, OrderStatus::Pending, OrderStatus::Debited)?;

        Ok(DebitOutcome::Committed(order))
    }
}
