use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use std::time::Duration;
use uuid::Uuid;

use super::{AccountStore, DebitOutcome, OrderLedger, OrderStore, StoreError};
use crate::config::DatabaseConfig;
use crate::domain::order::{NewOrder, Order, OrderStatus};
use crate::domain::{Account, AccountId};

// ============================================================================
// PostgreSQL Store
// ============================================================================
//
// Balances and orders live in two tables. Every balance change goes through
// a conditional UPDATE or through the ledger transaction, which holds the
// account row lock (`SELECT ... FOR UPDATE`) until commit; concurrent orders
// on one account therefore serialize while other accounts proceed.
//
// ============================================================================

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS accounts (
        id          TEXT PRIMARY KEY,
        balance     NUMERIC(20, 4) NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orders (
        id                UUID PRIMARY KEY,
        account_id        TEXT NOT NULL REFERENCES accounts (id),
        total             NUMERIC(20, 4) NOT NULL CHECK (total > 0),
        status            TEXT NOT NULL,
        idempotency_key   TEXT UNIQUE,
        publish_attempts  INTEGER NOT NULL DEFAULT 0,
        created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at        TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS orders_status_updated_idx
        ON orders (status, updated_at)
    "#,
];

const ORDER_COLUMNS: &str =
    "id, account_id, total, status, idempotency_key, publish_attempts, created_at, updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(&config.url)
            .await?;

        tracing::info!(max_connections = config.max_connections, "Connected to PostgreSQL");
        Ok(Self::new(pool))
    }

    /// Creates the tables if they are missing. Safe to run on every start.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement).execute(&self.pool).await?;
        }
        tracing::info!("Database schema ready");
        Ok(())
    }

    async fn fetch_by_key(
        conn: &mut PgConnection,
        key: &str,
    ) -> Result<Option<Order>, StoreError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE idempotency_key = $1");
        sqlx::query(&sql)
            .bind(key)
            .fetch_optional(conn)
            .await?
            .map(|row| order_from_row(&row))
            .transpose()
    }

    async fn insert_pending(
        conn: &mut PgConnection,
        new_order: &NewOrder,
    ) -> Result<Order, StoreError> {
        let sql = format!(
            "INSERT INTO orders (id, account_id, total, status, idempotency_key)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::now_v7())
            .bind(new_order.account_id.as_str())
            .bind(new_order.total)
            .bind(OrderStatus::Pending.as_str())
            .bind(new_order.idempotency_key.as_deref())
            .fetch_one(conn)
            .await
            .map_err(|e| insert_error(e, new_order))?;

        order_from_row(&row)
    }

    /// Works out why a conditional status UPDATE touched no row.
    async fn explain_missed_advance(&self, id: Uuid, from: OrderStatus) -> StoreError {
        match self.get_order(id).await {
            Ok(order) => StoreError::Conflict {
                order_id: id,
                expected: from,
                actual: order.status,
            },
            Err(err) => err,
        }
    }
}

fn insert_error(err: sqlx::Error, new_order: &NewOrder) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            if let Some(key) = &new_order.idempotency_key {
                return StoreError::IdempotencyKeyReused { key: key.clone() };
            }
        }
        if db_err.is_foreign_key_violation() {
            return StoreError::AccountNotFound(new_order.account_id.clone());
        }
    }
    err.into()
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    Ok(Account {
        id: AccountId::new(row.try_get::<String, _>("id")?),
        balance: row.try_get("balance")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order, StoreError> {
    let status: String = row.try_get("status")?;

    Ok(Order {
        id: row.try_get("id")?,
        account_id: AccountId::new(row.try_get::<String, _>("account_id")?),
        total: row.try_get("total")?,
        status: status.parse().map_err(StoreError::Decode)?,
        idempotency_key: row.try_get("idempotency_key")?,
        publish_attempts: row.try_get("publish_attempts")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl AccountStore for PgStore {
    async fn get_account(&self, id: &AccountId) -> Result<Account, StoreError> {
        sqlx::query("SELECT id, balance, updated_at FROM accounts WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .map(|row| account_from_row(&row))
            .transpose()?
            .ok_or_else(|| StoreError::AccountNotFound(id.clone()))
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query("SELECT id, balance, updated_at FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(account_from_row).collect()
    }

    async fn conditional_debit(&self, id: &AccountId, amount: Decimal) -> Result<Account, StoreError> {
        let row = sqlx::query(
            "UPDATE accounts
             SET balance = balance - $2, updated_at = now()
             WHERE id = $1 AND balance >= $2
             RETURNING id, balance, updated_at",
        )
        .bind(id.as_str())
        .bind(amount)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => account_from_row(&row),
            // Either the account is missing or the balance is short
            None => {
                let account = self.get_account(id).await?;
                Err(StoreError::InsufficientFunds {
                    account_id: id.clone(),
                    balance: account.balance,
                    requested: amount,
                })
            }
        }
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn insert_order(&self, new_order: NewOrder) -> Result<Order, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_pending(&mut conn, &new_order).await
    }

    async fn get_order(&self, id: Uuid) -> Result<Order, StoreError> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1");
        sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| order_from_row(&row))
            .transpose()?
            .ok_or(StoreError::OrderNotFound(id))
    }

    async fn advance_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<Order, StoreError> {
        if !from.can_advance_to(to) {
            return Err(self.explain_missed_advance(id, from).await);
        }

        let sql = format!(
            "UPDATE orders SET status = $3, updated_at = now()
             WHERE id = $1 AND status = $2
             RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => order_from_row(&row),
            None => Err(self.explain_missed_advance(id, from).await),
        }
    }

    async fn record_publish_failure(&self, id: Uuid) -> Result<i32, StoreError> {
        let row = sqlx::query(
            "UPDATE orders
             SET publish_attempts = publish_attempts + 1, updated_at = now()
             WHERE id = $1
             RETURNING publish_attempts",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::OrderNotFound(id))?;

        Ok(row.try_get("publish_attempts")?)
    }

    async fn list_stalled(
        &self,
        status: OrderStatus,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Order>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE status = $1 AND updated_at <= $2
             ORDER BY created_at
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(older_than)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl OrderLedger for PgStore {
    async fn commit_debit(&self, new_order: NewOrder) -> Result<DebitOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Concurrent ledgers on the same account queue up here
        let balance: Decimal = sqlx::query("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
            .bind(new_order.account_id.as_str())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::AccountNotFound(new_order.account_id.clone()))?
            .try_get("balance")?;

        if let Some(key) = &new_order.idempotency_key {
            if let Some(existing) = Self::fetch_by_key(&mut *tx, key).await? {
                tx.rollback().await?;
                if !new_order.matches(&existing) {
                    return Err(StoreError::IdempotencyKeyReused { key: key.clone() });
                }
                return Ok(DebitOutcome::Duplicate(existing));
            }
        }

        if balance < new_order.total {
            tx.rollback().await?;
            return Err(StoreError::InsufficientFunds {
                account_id: new_order.account_id,
                balance,
                requested: new_order.total,
            });
        }

        let pending = Self::insert_pending(&mut *tx, &new_order).await?;

        sqlx::query("UPDATE accounts SET balance = balance - $2, updated_at = now() WHERE id = $1")
            .bind(new_order.account_id.as_str())
            .bind(new_order.total)
            .execute(&mut *tx)
            .await?;

        let sql = format!(
            "UPDATE orders SET status = $2, updated_at = now()
             WHERE id = $1 AND status = $3
             RETURNING {ORDER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(pending.id)
            .bind(OrderStatus::Debited.as_str())
            .bind(OrderStatus::Pending.as_str())
            .fetch_one(&mut *tx)
            .await?;
        let order = order_from_row(&row)?;

        tx.commit().await?;

        tracing::debug!(
            order_id = %order.id,
            account_id = %order.account_id,
            total = %order.total,
            "Ledger committed"
        );

        Ok(DebitOutcome::Committed(order))
    }
}
