//! Execution coordinator.
//!
//! Turns an approved decision into idempotent exchange orders, drives
//! them to a terminal state, and settles confirmed fills into the
//! portfolio. It is the only writer of `PortfolioState`.
//!
//! Per order: write-ahead PENDING row, kill-switch re-check, submit with
//! retry under the same idempotency key, poll, settle. Every status
//! change is committed to the order store together with the portfolio it
//! produced, so a crash at any point is recoverable by
//! `reconcile_open_orders`.

use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::engine::accountant::{Accountant, FillDelta, ProtectiveLevels};
use crate::exchange::{ExchangeGateway, GatewayError};
use crate::retry::{RetryError, RetryPolicy};
use crate::storage::OrderStore;
use crate::strategy::risk::RiskGovernor;
use crate::types::{
    Action, Decision, ExecutionOutcome, Order, OrderKey, OrderStatus, PortfolioSnapshot, PortfolioState, Side,
};

// ---------------------------------------------------------------------------
// Settings and reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    /// Per-order quantity cap; larger sizes are split.
    pub max_order_size: Decimal,
    pub poll_interval: Duration,
    pub max_status_polls: u32,
    /// Open orders older than this are cancelled during reconciliation.
    pub cancel_after: chrono::Duration,
    pub levels: ProtectiveLevels,
}

impl From<&ExecutionConfig> for ExecutionSettings {
    fn from(cfg: &ExecutionConfig) -> Self {
        Self {
            max_order_size: cfg.max_order_size,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            max_status_polls: cfg.max_status_polls,
            cancel_after: chrono::Duration::seconds(cfg.cancel_after_secs as i64),
            levels: ProtectiveLevels {
                stop_loss_pct: cfg.stop_loss_pct,
                take_profit_pct: cfg.take_profit_pct,
            },
        }
    }
}

/// Result of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub checked: usize,
    /// Reached a terminal state during this pass.
    pub resolved: usize,
    pub cancelled: usize,
    /// Still open (or unreachable); retried next pass.
    pub unresolved: usize,
}

/// Local vs venue quantity for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionDrift {
    pub symbol: String,
    pub local: Decimal,
    pub venue: Decimal,
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

/// Split `size` into chunks no larger than `cap`.
fn split_size(size: Decimal, cap: Decimal) -> Vec<Decimal> {
    if cap <= Decimal::ZERO {
        return vec![size];
    }
    let mut chunks = Vec::new();
    let mut left = size;
    while left > Decimal::ZERO {
        let chunk = left.min(cap);
        chunks.push(chunk);
        left -= chunk;
    }
    chunks
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct ExecutionCoordinator {
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn OrderStore>,
    portfolio: RwLock<PortfolioState>,
    governor: RiskGovernor,
    retry: RetryPolicy<GatewayError>,
    settings: ExecutionSettings,
}

impl ExecutionCoordinator {
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn OrderStore>,
        governor: RiskGovernor,
        retry: RetryPolicy<GatewayError>,
        settings: ExecutionSettings,
        portfolio: PortfolioState,
    ) -> Self {
        Self {
            gateway,
            store,
            portfolio: RwLock::new(portfolio),
            governor,
            retry,
            settings,
        }
    }

    /// Build a coordinator over the portfolio last committed to `store`,
    /// or a fresh one holding `initial_cash`.
    pub async fn restore(
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn OrderStore>,
        governor: RiskGovernor,
        retry: RetryPolicy<GatewayError>,
        settings: ExecutionSettings,
        initial_cash: Decimal,
    ) -> Result<Self> {
        let portfolio = match store.load_portfolio().await? {
            Some(p) => {
                info!(cash = %p.cash, positions = p.open_positions(), "Portfolio restored from order store");
                p
            }
            None => PortfolioState::new(initial_cash),
        };
        Ok(Self::new(gateway, store, governor, retry, settings, portfolio))
    }

    pub async fn portfolio(&self) -> PortfolioState {
        self.portfolio.read().await.clone()
    }

    /// Immutable valuation for the start of a cycle.
    pub async fn snapshot(&self, marks: BTreeMap<String, Decimal>) -> PortfolioSnapshot {
        Accountant::snapshot(&*self.portfolio.read().await, marks, Utc::now())
    }

    /// Commit `order`, settling any fills not yet applied in the same
    /// store transaction.
    async fn persist(&self, order: &Order) -> Result<Option<FillDelta>> {
        let mut portfolio = self.portfolio.write().await;
        let mut next = portfolio.clone();
        let delta = Accountant::apply_order_fills(&mut next, order, &self.settings.levels, Utc::now());
        if delta.is_some() {
            self.store.commit(order, Some(&next)).await?;
            *portfolio = next;
        } else {
            self.store.commit(order, None).await?;
        }
        Ok(delta)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Execute an approved decision of `size`. Stops early (leaving open
    /// orders for reconciliation) on rejection, exhausted retries, the
    /// kill switch, or `deadline`. A BUY also stops once the next chunk,
    /// priced at the last confirmed fill, would break the exposure limit.
    pub async fn execute(
        &self,
        decision: &Decision,
        size: Decimal,
        deadline: Option<Instant>,
    ) -> Result<ExecutionOutcome> {
        let mut outcome = ExecutionOutcome::empty();
        let Some(side) = decision.action.side() else {
            return Ok(outcome);
        };

        let chunks = split_size(size, self.settings.max_order_size);
        info!(
            cycle = decision.cycle_id,
            action = %decision.action,
            %size,
            orders = chunks.len(),
            "Executing decision"
        );

        let mut last_fill_price: Option<Decimal> = None;
        for (seq, qty) in chunks.into_iter().enumerate() {
            let key = OrderKey::new(decision.cycle_id, &decision.symbol, decision.action, seq as u32);
            let id = key.to_string();

            let mut order = match self.store.get(&id).await? {
                Some(existing) if existing.status.is_terminal() => {
                    debug!(order = %id, status = %existing.status, "Order already terminal, skipping");
                    last_fill_price = existing.avg_fill_price.or(last_fill_price);
                    outcome.filled_quantity += existing.filled_quantity;
                    outcome.orders.push(existing);
                    continue;
                }
                Some(existing) => {
                    info!(order = %id, status = %existing.status, "Resuming open order");
                    existing
                }
                None => {
                    if self.governor.is_halted() {
                        warn!(order = %id, "Kill switch engaged, not placing order");
                        outcome.blocked_by_kill_switch = true;
                        break;
                    }
                    if side == Side::Buy {
                        if let Some(price) = last_fill_price {
                            if self.exceeds_headroom(qty, price).await {
                                warn!(order = %id, %qty, %price, "Next chunk would exceed exposure limit, stopping");
                                outcome.exposure_capped = true;
                                break;
                            }
                        }
                    }
                    let order = Order::pending(&key, side, qty, Utc::now());
                    self.store.commit(&order, None).await?;
                    order
                }
            };

            if expired(deadline) {
                outcome.deadline_hit = true;
                outcome.open_order_ids.push(order.id.clone());
                outcome.orders.push(order);
                break;
            }

            if matches!(order.status, OrderStatus::Pending | OrderStatus::Failed) {
                // Last check before anything reaches the exchange.
                if self.governor.is_halted() {
                    outcome.blocked_by_kill_switch = true;
                    if order.status == OrderStatus::Pending {
                        warn!(order = %id, "Kill switch engaged after write-ahead, cancelling locally");
                        order.transition(OrderStatus::Cancelled, Utc::now())?;
                        self.store.commit(&order, None).await?;
                    } else {
                        outcome.open_order_ids.push(order.id.clone());
                    }
                    outcome.orders.push(order);
                    break;
                }

                if !self.submit(&mut order, deadline, &mut outcome).await? {
                    outcome.orders.push(order);
                    break;
                }
            }

            self.poll_until_terminal(&mut order, deadline, &mut outcome).await?;

            if !order.status.is_terminal() {
                outcome.open_order_ids.push(order.id.clone());
            }
            outcome.filled_quantity += order.filled_quantity;
            last_fill_price = order.avg_fill_price.or(last_fill_price);
            let stop = outcome.deadline_hit || order.status == OrderStatus::Rejected;
            outcome.orders.push(order);
            if stop {
                break;
            }
        }

        outcome.effective_action = if outcome.filled_quantity > Decimal::ZERO {
            decision.action
        } else {
            Action::Hold
        };
        info!(cycle = decision.cycle_id, outcome = %outcome, "Execution finished");
        Ok(outcome)
    }

    /// Whether buying `qty` more at `price` would take total exposure past
    /// the governor's limit.
    async fn exceeds_headroom(&self, qty: Decimal, price: Decimal) -> bool {
        let limit = self.governor.envelope().limits.max_position_size;
        let exposure = self.portfolio.read().await.exposure();
        exposure + qty * price > limit
    }

    /// Submit with retry, giving up once `deadline` would be passed.
    /// Returns whether the pipeline may continue with this order (false on
    /// rejection or failure).
    async fn submit(
        &self,
        order: &mut Order,
        deadline: Option<Instant>,
        outcome: &mut ExecutionOutcome,
    ) -> Result<bool> {
        let gateway = &self.gateway;
        let (id, symbol, side, qty) = (order.id.as_str(), order.symbol.as_str(), order.side, order.quantity);

        let result = self
            .retry
            .execute("submit_order", deadline, move |_| gateway.submit_order(id, symbol, side, qty))
            .await;

        let now = Utc::now();
        match result {
            Ok(ack) => {
                order.retry_count += ack.attempts.saturating_sub(1);
                order.absorb(&ack.value, now)?;
                self.persist(order).await?;
                info!(order = %order.id, status = %order.status, attempts = ack.attempts, "Order accepted");
                Ok(true)
            }
            Err(RetryError::Permanent {
                error: GatewayError::Rejected { reason },
                attempts,
            }) => {
                warn!(order = %order.id, %reason, "Order rejected by exchange");
                order.retry_count += attempts.saturating_sub(1);
                order.reject_reason = Some(reason.clone());
                order.transition(OrderStatus::Rejected, now)?;
                self.persist(order).await?;
                outcome.rejection = Some(reason);
                Ok(false)
            }
            Err(e) => {
                error!(order = %order.id, attempts = e.attempts(), error = %e.error(), "Order submission failed");
                order.retry_count += e.attempts().saturating_sub(1);
                order.transition(OrderStatus::Failed, now)?;
                self.persist(order).await?;
                if matches!(e, RetryError::DeadlineExceeded { .. }) {
                    outcome.deadline_hit = true;
                }
                outcome.failed = true;
                outcome.open_order_ids.push(order.id.clone());
                Ok(false)
            }
        }
    }

    async fn poll_until_terminal(
        &self,
        order: &mut Order,
        deadline: Option<Instant>,
        outcome: &mut ExecutionOutcome,
    ) -> Result<()> {
        for poll in 0..self.settings.max_status_polls {
            if order.status.is_terminal() {
                return Ok(());
            }
            if expired(deadline) {
                outcome.deadline_hit = true;
                return Ok(());
            }
            if poll > 0 {
                let mut wait = self.settings.poll_interval;
                if let Some(d) = deadline {
                    wait = wait.min(d.saturating_duration_since(Instant::now()));
                }
                tokio::time::sleep(wait).await;
            }
            match self.gateway.get_order_status(&order.id).await {
                Ok(reported) => {
                    if order.absorb(&reported, Utc::now())? {
                        self.persist(order).await?;
                    }
                }
                Err(e) if e.is_retryable() => {
                    debug!(order = %order.id, error = %e, "Status poll failed, will retry");
                }
                Err(e) => {
                    warn!(order = %order.id, error = %e, "Status poll failed, leaving for reconciliation");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reconciliation
    // -----------------------------------------------------------------------

    /// Resolve every non-terminal order in the store against the
    /// exchange. Run at startup and at the top of each cycle. Orders not
    /// reached before `deadline` are counted unresolved and left for the
    /// next pass.
    pub async fn reconcile_open_orders(&self, deadline: Option<Instant>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let open = self.store.unsettled().await?;
        let total = open.len();
        for (i, mut order) in open.into_iter().enumerate() {
            if expired(deadline) {
                warn!(remaining = total - i, "Deadline reached during reconciliation");
                report.unresolved += total - i;
                break;
            }
            report.checked += 1;
            let now = Utc::now();
            match self.gateway.get_order_status(&order.id).await {
                Ok(reported) => {
                    order.absorb(&reported, now)?;
                }
                Err(GatewayError::UnknownOrder(_)) => {
                    info!(order = %order.id, "Order never reached the exchange, cancelling");
                    order.transition(OrderStatus::Cancelled, now)?;
                }
                Err(e) => {
                    warn!(order = %order.id, error = %e, "Could not reconcile order");
                    report.unresolved += 1;
                    continue;
                }
            }

            if !order.status.is_terminal() && now - order.created_at > self.settings.cancel_after {
                match self.gateway.cancel_order(&order.id).await {
                    Ok(reported) => {
                        order.absorb(&reported, now)?;
                        info!(order = %order.id, status = %order.status, "Stale open order cancelled");
                    }
                    Err(e) => warn!(order = %order.id, error = %e, "Cancel of stale order failed"),
                }
            }

            self.persist(&order).await?;
            if order.status == OrderStatus::Cancelled {
                report.cancelled += 1;
            }
            if order.status.is_terminal() {
                report.resolved += 1;
            } else {
                report.unresolved += 1;
            }
        }
        if report.checked > 0 {
            info!(
                checked = report.checked,
                resolved = report.resolved,
                unresolved = report.unresolved,
                "Reconciliation pass complete"
            );
        }
        Ok(report)
    }

    /// Compare local holdings with the venue's and log any drift.
    pub async fn verify_positions(&self) -> Result<Vec<PositionDrift>> {
        let venue = self
            .gateway
            .get_open_positions()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to fetch venue positions: {e}"))?;
        let local = self.portfolio().await;

        let symbols: std::collections::BTreeSet<&String> =
            local.positions.keys().chain(venue.positions.keys()).collect();
        let drift: Vec<PositionDrift> = symbols
            .into_iter()
            .filter_map(|s| {
                let (l, v) = (local.held(s), venue.held(s));
                (l != v).then(|| PositionDrift {
                    symbol: s.clone(),
                    local: l,
                    venue: v,
                })
            })
            .collect();
        for d in &drift {
            warn!(symbol = %d.symbol, local = %d.local, venue = %d.venue, "Position drift detected");
        }
        Ok(drift)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
