//! In-process exchange for simulation mode and tests.
//!
//! Orders fill at the simulated market's last price, either as soon as
//! they are submitted or on the first status query. The exchange keeps
//! its own cash and position ledger so `get_open_positions` can be
//! compared against the agent's portfolio.
//!
//! Fault injection:
//! - `fail_next_submits(n)`: the next n submissions fail with a network
//!   error before the order is recorded.
//! - `lose_next_acks(n)`: the next n submissions are recorded (and may
//!   fill) but the caller sees a timeout, as if the acknowledgement was
//!   lost on the wire.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::{ExchangeGateway, GatewayError};
use crate::signals::simulated::SimulatedMarket;
use crate::types::{Action, Order, OrderKey, OrderStatus, PortfolioState, Position, Side};

/// When submitted orders fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    Immediate,
    /// Orders stay SUBMITTED until the first `get_order_status`.
    OnQuery,
}

struct Book {
    orders: HashMap<String, Order>,
    ledger: PortfolioState,
}

pub struct SimulatedExchange {
    market: Arc<SimulatedMarket>,
    mode: FillMode,
    book: Mutex<Book>,
    fail_submits: AtomicU32,
    lose_acks: AtomicU32,
    submissions: AtomicUsize,
}

impl SimulatedExchange {
    pub fn new(market: Arc<SimulatedMarket>, cash: Decimal, mode: FillMode) -> Self {
        Self::with_ledger(market, &PortfolioState::new(cash), mode)
    }

    /// Open the venue holding the cash and positions of `portfolio`, as
    /// when the agent restarts against an account it already trades.
    pub fn with_ledger(market: Arc<SimulatedMarket>, portfolio: &PortfolioState, mode: FillMode) -> Self {
        let mut ledger = PortfolioState::new(portfolio.cash);
        ledger.positions = portfolio.positions.clone();
        Self {
            market,
            mode,
            book: Mutex::new(Book {
                orders: HashMap::new(),
                ledger,
            }),
            fail_submits: AtomicU32::new(0),
            lose_acks: AtomicU32::new(0),
            submissions: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_submits(&self, n: u32) {
        self.fail_submits.store(n, Ordering::SeqCst);
    }

    pub fn lose_next_acks(&self, n: u32) {
        self.lose_acks.store(n, Ordering::SeqCst);
    }

    /// Calls to `submit_order`, including failed and repeated ones.
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Distinct orders recorded.
    pub fn order_count(&self) -> usize {
        self.book().orders.len()
    }

    fn book(&self) -> std::sync::MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Fill `order` at the market price, updating the venue ledger. A fill
    /// that cannot be funded or covered rejects the order instead.
    fn try_fill(&self, ledger: &mut PortfolioState, order: &mut Order) {
        let now = Utc::now();
        let Some(price) = self.market.last_price(&order.symbol) else {
            order.status = OrderStatus::Rejected;
            order.reject_reason = Some(format!("no market for {}", order.symbol));
            order.updated_at = now;
            return;
        };
        let qty = order.quantity;
        match order.side {
            Side::Buy => {
                let cost = qty * price;
                if cost > ledger.cash {
                    order.status = OrderStatus::Rejected;
                    order.reject_reason = Some(format!("insufficient funds: need {cost}, have {}", ledger.cash));
                    order.updated_at = now;
                    return;
                }
                ledger.cash -= cost;
                let pos = ledger.positions.entry(order.symbol.clone()).or_insert_with(|| Position {
                    symbol: order.symbol.clone(),
                    quantity: Decimal::ZERO,
                    entry_price: price,
                    stop_loss: None,
                    take_profit: None,
                    opened_at: now,
                });
                let total = pos.quantity + qty;
                pos.entry_price = (pos.entry_price * pos.quantity + price * qty) / total;
                pos.quantity = total;
            }
            Side::Sell => {
                let held = ledger.held(&order.symbol);
                if qty > held {
                    order.status = OrderStatus::Rejected;
                    order.reject_reason = Some(format!("insufficient position: have {held}, sell {qty}"));
                    order.updated_at = now;
                    return;
                }
                ledger.cash += qty * price;
                if qty == held {
                    ledger.positions.remove(&order.symbol);
                } else if let Some(pos) = ledger.positions.get_mut(&order.symbol) {
                    pos.quantity -= qty;
                }
            }
        }
        order.filled_quantity = qty;
        order.avg_fill_price = Some(price);
        order.status = OrderStatus::Filled;
        order.updated_at = now;
    }
}

#[async_trait]
impl ExchangeGateway for SimulatedExchange {
    async fn submit_order(
        &self,
        idempotency_key: &str,
        symbol: &str,
        side: Side,
        quantity: Decimal,
    ) -> Result<Order, GatewayError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if Self::take_one(&self.fail_submits) {
            return Err(GatewayError::Network("injected connection reset".into()));
        }

        let order = {
            let mut guard = self.book();
            let book = &mut *guard;
            if let Some(existing) = book.orders.get(idempotency_key) {
                debug!(key = idempotency_key, "Duplicate submission, returning original order");
                existing.clone()
            } else {
                if quantity <= Decimal::ZERO {
                    return Err(GatewayError::Rejected {
                        reason: format!("invalid size {quantity}"),
                    });
                }
                let key = OrderKey::parse(idempotency_key)
                    .unwrap_or_else(|| OrderKey::new(0, symbol, side_action(side), 0));
                let mut order = Order::pending(&key, side, quantity, Utc::now());
                order.id = idempotency_key.to_string();
                order.status = OrderStatus::Submitted;
                if self.mode == FillMode::Immediate {
                    self.try_fill(&mut book.ledger, &mut order);
                }
                book.orders.insert(order.id.clone(), order.clone());
                order
            }
        };

        if Self::take_one(&self.lose_acks) {
            return Err(GatewayError::Timeout);
        }
        if order.status == OrderStatus::Rejected {
            return Err(GatewayError::Rejected {
                reason: order.reject_reason.unwrap_or_default(),
            });
        }
        Ok(order)
    }

    async fn get_order_status(&self, order_id: &str) -> Result<Order, GatewayError> {
        let mut guard = self.book();
        let book = &mut *guard;
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;
        if order.status == OrderStatus::Submitted {
            self.try_fill(&mut book.ledger, order);
        }
        Ok(order.clone())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<Order, GatewayError> {
        let mut book = self.book();
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;
        if !order.status.is_terminal() {
            order.status = OrderStatus::Cancelled;
            order.updated_at = Utc::now();
        }
        Ok(order.clone())
    }

    async fn get_open_positions(&self) -> Result<PortfolioState, GatewayError> {
        Ok(self.book().ledger.clone())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

fn side_action(side: Side) -> Action {
    match side {
        Side::Buy => Action::Buy,
        Side::Sell => Action::Sell,
    }
}
