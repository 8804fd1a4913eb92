pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::order::{NewOrder, Order, OrderError, OrderStatus};
use crate::domain::{Account, AccountId};

pub use memory::InMemoryStore;
pub use postgres::PgStore;

// ============================================================================
// Storage Seams
// ============================================================================
//
// Three traits so the processor can be driven by Postgres in production and
// by the in-memory store (or a mock) in tests:
// - AccountStore: balances, read and conditional debit
// - OrderStore: order rows and their status machine
// - OrderLedger: the one atomic unit spanning both tables
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Order not found: {0}")]
    OrderNotFound(Uuid),

    #[error("Insufficient funds on account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("Order {order_id} is {actual}, expected {expected}")]
    Conflict {
        order_id: Uuid,
        expected: OrderStatus,
        actual: OrderStatus,
    },

    #[error("Idempotency key {key} was already used for a different order")]
    IdempotencyKeyReused { key: String },

    #[error("Stored row could not be decoded: {0}")]
    Decode(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
                StoreError::Decode(err.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<StoreError> for OrderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AccountNotFound(id) => OrderError::AccountNotFound(id),
            StoreError::OrderNotFound(id) => OrderError::OrderNotFound(id),
            StoreError::InsufficientFunds {
                account_id,
                balance,
                requested,
            } => OrderError::InsufficientFunds {
                account_id,
                balance,
                requested,
            },
            StoreError::Conflict {
                order_id,
                expected,
                actual,
            } => OrderError::Conflict {
                order_id,
                expected,
                actual,
            },
            StoreError::IdempotencyKeyReused { key } => OrderError::IdempotencyKeyReused { key },
            StoreError::Decode(msg) | StoreError::Unavailable(msg) => {
                OrderError::PersistenceFailure(msg)
            }
        }
    }
}

/// Result of `OrderLedger::commit_debit`.
#[derive(Debug, Clone, PartialEq)]
pub enum DebitOutcome {
    /// New order inserted and the account debited.
    Committed(Order),
    /// The idempotency key already belonged to this order; nothing was debited.
    Duplicate(Order),
}

impl DebitOutcome {
    pub fn order(&self) -> &Order {
        match self {
            DebitOutcome::Committed(order) | DebitOutcome::Duplicate(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            DebitOutcome::Committed(order) | DebitOutcome::Duplicate(order) => order,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, DebitOutcome::Duplicate(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_account(&self, id: &AccountId) -> Result<Account, StoreError>;

    /// Every account, ordered by id.
    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError>;

    /// Debits `amount` only if the balance covers it, in one critical section.
    async fn conditional_debit(&self, id: &AccountId, amount: Decimal) -> Result<Account, StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Inserts a `Pending` order with a fresh v7 id.
    async fn insert_order(&self, new_order: NewOrder) -> Result<Order, StoreError>;

    async fn get_order(&self, id: Uuid) -> Result<Order, StoreError>;

    /// Moves `id` from exactly `from` to `to`. Illegal transitions and a
    /// stored status other than `from` fail with `Conflict`, leaving the row
    /// untouched.
    async fn advance_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Order, StoreError>;

    /// Returns the attempt count after the increment.
    async fn record_publish_failure(&self, id: Uuid) -> Result<i32, StoreError>;

    /// Orders in `status` not touched since `older_than`, oldest first.
    async fn list_stalled(
        &self,
        status: OrderStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderLedger: Send + Sync {
    /// Locks the account, re-checks the balance, inserts the order, debits
    /// and advances the order to `Debited`, all or nothing.
    async fn commit_debit(&self, new_order: NewOrder) -> Result<DebitOutcome, StoreError>;
}

/// The three store handles the processor works with.
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub orders: Arc<dyn OrderStore>,
    pub ledger: Arc<dyn OrderLedger>,
}

impl Stores {
    /// All three roles served by one backend.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: AccountStore + OrderStore + OrderLedger + 'static,
    {
        Self {
            accounts: store.clone(),
            orders: store.clone(),
            ledger: store,
        }
    }
}
