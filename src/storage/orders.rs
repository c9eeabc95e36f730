//! Durable order and portfolio store.
//!
//! The execution coordinator writes every order ahead of submission
//! (PENDING) and commits each later status change together with the
//! portfolio it produced, in one transaction. After a crash the store is
//! the source of truth for which keys were already used and which orders
//! still need reconciling.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::types::{HydraError, Order, PortfolioState};

/// Persistence for orders and the portfolio they settle into.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get(&self, order_id: &str) -> Result<Option<Order>>;

    /// Upsert `order`, and when given, replace the stored portfolio in the
    /// same transaction. A terminal order row is never changed again;
    /// attempting it is an error and nothing is written.
    async fn commit(&self, order: &Order, portfolio: Option<&PortfolioState>) -> Result<()>;

    /// Orders not yet in a terminal state (PENDING, SUBMITTED,
    /// PARTIALLY_FILLED, FAILED).
    async fn unsettled(&self) -> Result<Vec<Order>>;

    async fn load_portfolio(&self) -> Result<Option<PortfolioState>>;

    async fn orders_for_cycle(&self, cycle_id: u64) -> Result<Vec<Order>>;
}

fn terminal_conflict(order: &Order, stored: &Order) -> anyhow::Error {
    HydraError::IllegalTransition {
        order_id: order.id.clone(),
        from: stored.status,
        to: order.status,
    }
    .into()
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

const CREATE_ORDERS: &str = "CREATE TABLE IF NOT EXISTS orders (
    id          TEXT PRIMARY KEY,
    cycle_id    INTEGER NOT NULL,
    status      TEXT NOT NULL,
    body        TEXT NOT NULL,
    updated_at  TEXT NOT NULL
)";

const CREATE_ORDERS_STATUS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status)";

const CREATE_PORTFOLIO: &str = "CREATE TABLE IF NOT EXISTS portfolio (
    id     INTEGER PRIMARY KEY CHECK (id = 1),
    state  TEXT NOT NULL
)";

const UPSERT_ORDER: &str = "INSERT INTO orders (id, cycle_id, status, body, updated_at)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT (id) DO UPDATE SET
        status = excluded.status,
        body = excluded.body,
        updated_at = excluded.updated_at
    WHERE orders.status NOT IN ('FILLED', 'CANCELLED', 'REJECTED')";

const UPSERT_PORTFOLIO: &str = "INSERT INTO portfolio (id, state) VALUES (1, ?1)
    ON CONFLICT (id) DO UPDATE SET state = excluded.state";

pub struct SqliteOrderStore {
    pool: SqlitePool,
}

impl SqliteOrderStore {
    /// Open (creating if missing) the database at `url`, e.g.
    /// `sqlite://hydra_orders.db`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .with_context(|| format!("Invalid order database URL: {url}"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open order database {url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        info!(url, "Order store ready");
        Ok(store)
    }

    /// Private in-memory database. The pool keeps its single connection
    /// alive for the life of the store.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory order database")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        for stmt in [CREATE_ORDERS, CREATE_ORDERS_STATUS_INDEX, CREATE_PORTFOLIO] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("Failed to create order store schema")?;
        }
        Ok(())
    }

    fn decode(body: &str) -> Result<Order> {
        serde_json::from_str(body).context("Corrupt order row")
    }
}

#[async_trait]
impl OrderStore for SqliteOrderStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query("SELECT body FROM orders WHERE id = ?1")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read order")?;
        row.map(|r| Self::decode(&r.try_get::<String, _>("body")?)).transpose()
    }

    async fn commit(&self, order: &Order, portfolio: Option<&PortfolioState>) -> Result<()> {
        let body = serde_json::to_string(order).context("Failed to serialise order")?;
        let mut tx = self.pool.begin().await.context("Failed to begin transaction")?;

        let written = sqlx::query(UPSERT_ORDER)
            .bind(&order.id)
            .bind(order.cycle_id as i64)
            .bind(order.status.as_str())
            .bind(&body)
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await
            .context("Failed to write order")?
            .rows_affected();

        if written == 0 {
            let row = sqlx::query("SELECT body FROM orders WHERE id = ?1")
                .bind(&order.id)
                .fetch_one(&mut *tx)
                .await
                .context("Failed to read conflicting order")?;
            let stored = Self::decode(&row.try_get::<String, _>("body")?)?;
            if stored == *order {
                return Ok(());
            }
            return Err(terminal_conflict(order, &stored));
        }

        if let Some(portfolio) = portfolio {
            let state = serde_json::to_string(portfolio).context("Failed to serialise portfolio")?;
            sqlx::query(UPSERT_PORTFOLIO)
                .bind(state)
                .execute(&mut *tx)
                .await
                .context("Failed to write portfolio")?;
        }

        tx.commit().await.context("Failed to commit order transaction")?;
        debug!(order = %order.id, status = %order.status, with_portfolio = portfolio.is_some(), "Order committed");
        Ok(())
    }

    async fn unsettled(&self) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            "SELECT body FROM orders
             WHERE status NOT IN ('FILLED', 'CANCELLED', 'REJECTED')
             ORDER BY cycle_id, id",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list unsettled orders")?;
        rows.iter()
            .map(|r| Self::decode(&r.try_get::<String, _>("body")?))
            .collect()
    }

    async fn load_portfolio(&self) -> Result<Option<PortfolioState>> {
        let row = sqlx::query("SELECT state FROM portfolio WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read portfolio")?;
        row.map(|r| -> Result<PortfolioState> {
            let state: String = r.try_get("state")?;
            serde_json::from_str(&state).context("Corrupt portfolio row")
        })
        .transpose()
    }

    async fn orders_for_cycle(&self, cycle_id: u64) -> Result<Vec<Order>> {
        let rows = sqlx::query("SELECT body FROM orders WHERE cycle_id = ?1 ORDER BY id")
            .bind(cycle_id as i64)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list cycle orders")?;
        rows.iter()
            .map(|r| Self::decode(&r.try_get::<String, _>("body")?))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    orders: BTreeMap<String, Order>,
    portfolio: Option<PortfolioState>,
}

/// Store with the same semantics as `SqliteOrderStore`, kept in memory.
#[derive(Default)]
pub struct MemoryOrderStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn get(&self, order_id: &str) -> Result<Option<Order>> {
        Ok(self.inner().orders.get(order_id).cloned())
    }

    async fn commit(&self, order: &Order, portfolio: Option<&PortfolioState>) -> Result<()> {
        let mut inner = self.inner();
        if let Some(stored) = inner.orders.get(&order.id) {
            if stored.status.is_terminal() {
                if stored == order {
                    return Ok(());
                }
                return Err(terminal_conflict(order, stored));
            }
        }
        inner.orders.insert(order.id.clone(), order.clone());
        if let Some(portfolio) = portfolio {
            inner.portfolio = Some(portfolio.clone());
        }
        Ok(())
    }

    async fn unsettled(&self) -> Result<Vec<Order>> {
        let mut open: Vec<Order> = self
            .inner()
            .orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by(|a, b| (a.cycle_id, &a.id).cmp(&(b.cycle_id, &b.id)));
        Ok(open)
    }

    async fn load_portfolio(&self) -> Result<Option<PortfolioState>> {
        Ok(self.inner().portfolio.clone())
    }

    async fn orders_for_cycle(&self, cycle_id: u64) -> Result<Vec<Order>> {
        Ok(self
            .inner()
            .orders
            .values()
            .filter(|o| o.cycle_id == cycle_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
