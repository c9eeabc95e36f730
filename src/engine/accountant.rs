//! Accountant: portfolio arithmetic for confirmed fills.
//!
//! Applies fills to cash and positions (weighted-average entry on buys,
//! realized PnL on sells), keeps the per-order fill ledger that makes
//! settlement exactly-once, and values the portfolio into snapshots.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::types::{
    AppliedFill, EquityPoint, Order, PortfolioSnapshot, PortfolioState, Position, Side,
};

/// Equity points kept in the portfolio; older points are dropped.
pub const MAX_EQUITY_POINTS: usize = 1_000;

// ---------------------------------------------------------------------------
// Protective levels
// ---------------------------------------------------------------------------

/// Stop-loss and take-profit distances as fractions of entry price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectiveLevels {
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Decimal,
}

impl ProtectiveLevels {
    fn apply(&self, pos: &mut Position) {
        pos.stop_loss = (self.stop_loss_pct > Decimal::ZERO)
            .then(|| (pos.entry_price * (Decimal::ONE - self.stop_loss_pct)).round_dp(8));
        pos.take_profit = (self.take_profit_pct > Decimal::ZERO)
            .then(|| (pos.entry_price * (Decimal::ONE + self.take_profit_pct)).round_dp(8));
    }
}

// ---------------------------------------------------------------------------
// Fill effect
// ---------------------------------------------------------------------------

/// What one settlement changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FillDelta {
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub realized_pnl: Decimal,
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant;

impl Accountant {
    /// Apply whatever part of `order`'s fills has not been applied yet.
    ///
    /// The fill ledger in `portfolio` records quantity and notional per
    /// order id, so calling this again with the same order state is a
    /// no-op. Returns `None` when there is nothing new to apply.
    pub fn apply_order_fills(
        portfolio: &mut PortfolioState,
        order: &Order,
        levels: &ProtectiveLevels,
        now: DateTime<Utc>,
    ) -> Option<FillDelta> {
        let prior = portfolio.applied(&order.id);
        let delta_qty = order.filled_quantity - prior.quantity;
        if delta_qty <= Decimal::ZERO {
            return None;
        }
        let Some(avg) = order.avg_fill_price else {
            warn!(order = %order.id, "Fill reported without a price, deferring settlement");
            return None;
        };

        // Price the increment from the change in total notional so a
        // moving average price is not applied to earlier fills twice.
        let total_notional = order.filled_quantity * avg;
        let delta_notional = total_notional - prior.notional;
        let price = if delta_notional > Decimal::ZERO {
            delta_notional / delta_qty
        } else {
            avg
        };

        let delta = Self::apply_fill(portfolio, &order.symbol, order.side, delta_qty, price, levels, now);
        portfolio.applied_fills.insert(
            order.id.clone(),
            AppliedFill {
                quantity: order.filled_quantity,
                notional: total_notional,
            },
        );
        Some(delta)
    }

    /// Apply a single fill at `price`.
    pub fn apply_fill(
        portfolio: &mut PortfolioState,
        symbol: &str,
        side: Side,
        quantity: Decimal,
        price: Decimal,
        levels: &ProtectiveLevels,
        now: DateTime<Utc>,
    ) -> FillDelta {
        let mut realized = Decimal::ZERO;
        let mut quantity = quantity;

        match side {
            Side::Buy => {
                portfolio.cash -= quantity * price;
                let pos = portfolio
                    .positions
                    .entry(symbol.to_string())
                    .or_insert_with(|| Position {
                        symbol: symbol.to_string(),
                        quantity: Decimal::ZERO,
                        entry_price: price,
                        stop_loss: None,
                        take_profit: None,
                        opened_at: now,
                    });
                let total = pos.quantity + quantity;
                pos.entry_price = (pos.entry_price * pos.quantity + price * quantity) / total;
                pos.quantity = total;
                levels.apply(pos);
            }
            Side::Sell => {
                let held = portfolio.held(symbol);
                if quantity > held {
                    warn!(symbol, %quantity, %held, "Sell fill exceeds holding, clamping");
                    quantity = held;
                }
                if let Some(pos) = portfolio.positions.get_mut(symbol) {
                    realized = (price - pos.entry_price) * quantity;
                    pos.quantity -= quantity;
                    if pos.quantity <= Decimal::ZERO {
                        portfolio.positions.remove(symbol);
                    }
                }
                portfolio.cash += quantity * price;
                portfolio.realized_pnl += realized;
            }
        }

        let marks = BTreeMap::from([(symbol.to_string(), price)]);
        let equity = portfolio.equity(&marks);
        portfolio.equity_curve.push(EquityPoint { at: now, equity });
        if portfolio.equity_curve.len() > MAX_EQUITY_POINTS {
            let excess = portfolio.equity_curve.len() - MAX_EQUITY_POINTS;
            portfolio.equity_curve.drain(..excess);
        }

        info!(
            symbol,
            %side,
            %quantity,
            %price,
            realized = %realized,
            cash = %portfolio.cash.round_dp(2),
            equity = %equity.round_dp(2),
            "Fill applied"
        );

        FillDelta {
            side,
            quantity,
            price,
            realized_pnl: realized,
        }
    }

    /// Value the portfolio at `marks` (entry price where no mark exists).
    pub fn snapshot(
        portfolio: &PortfolioState,
        marks: BTreeMap<String, Decimal>,
        now: DateTime<Utc>,
    ) -> PortfolioSnapshot {
        let unrealized_pnl = portfolio
            .positions
            .values()
            .map(|p| p.unrealized_pnl(marks.get(&p.symbol).copied().unwrap_or(p.entry_price)))
            .sum();
        PortfolioSnapshot {
            equity: portfolio.equity(&marks),
            exposure: portfolio.exposure(),
            unrealized_pnl,
            state: portfolio.clone(),
            marks,
            taken_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Action, OrderKey, OrderStatus};
    use rust_decimal_macros::dec;

    fn make_levels() -> ProtectiveLevels {
        ProtectiveLevels {
            stop_loss_pct: dec!(0.02),
            take_profit_pct: dec!(0.03),
        }
    }

    fn make_order(side: Side, filled: Decimal, avg: Decimal) -> Order {
        let action = if side == Side::Buy { Action::Buy } else { Action::Sell };
        let key = OrderKey::new(1, "BTCUSDT", action, 0);
        let mut order = Order::pending(&key, side, dec!(2), Utc::now());
        order.status = OrderStatus::PartiallyFilled;
        order.filled_quantity = filled;
        order.avg_fill_price = Some(avg);
        order
    }

    #[test]
    fn test_buy_sets_weighted_entry_and_protection() {
        let mut p = PortfolioState::new(dec!(1000));
        Accountant::apply_fill(&mut p, "BTCUSDT", Side::Buy, dec!(1), dec!(100), &make_levels(), Utc::now());
        Accountant::apply_fill(&mut p, "BTCUSDT", Side::Buy, dec!(3), dec!(200), &make_levels(), Utc::now());

        let pos = p.position("BTCUSDT").unwrap();
        assert_eq!(pos.quantity, dec!(4));
        assert_eq!(pos.entry_price, dec!(175));
        assert_eq!(pos.stop_loss, Some(dec!(171.5)));
        assert_eq!(pos.take_profit, Some(dec!(180.25)));
        assert_eq!(p.cash, dec!(300));
        assert_eq!(p.equity_curve.len(), 2);
    }

    #[test]
    fn test_sell_realizes_pnl_and_closes() {
        let mut p = PortfolioState::new(dec!(1000));
        Accountant::apply_fill(&mut p, "BTCUSDT", Side::Buy, dec!(2), dec!(100), &make_levels(), Utc::now());
        let d = Accountant::apply_fill(&mut p, "BTCUSDT", Side::Sell, dec!(1), dec!(110), &make_levels(), Utc::now());
        assert_eq!(d.realized_pnl, dec!(10));
        assert_eq!(p.held("BTCUSDT"), dec!(1));

        Accountant::apply_fill(&mut p, "BTCUSDT", Side::Sell, dec!(5), dec!(90), &make_levels(), Utc::now());
        assert!(p.position("BTCUSDT").is_none());
        assert_eq!(p.realized_pnl, dec!(0));
        assert_eq!(p.cash, dec!(1000));
    }

    #[test]
    fn test_equity_curve_is_capped() {
        let mut p = PortfolioState::new(dec!(1000000));
        for i in 0..(MAX_EQUITY_POINTS + 25) {
            let price = Decimal::from(100 + i as i64);
            Accountant::apply_fill(&mut p, "BTCUSDT", Side::Buy, dec!(1), price, &make_levels(), Utc::now());
        }
        assert_eq!(p.equity_curve.len(), MAX_EQUITY_POINTS);
        // The newest point survives the trim.
        let last = p.equity_curve.last().unwrap().equity;
        let marks = BTreeMap::from([("BTCUSDT".to_string(), Decimal::from(100 + (MAX_EQUITY_POINTS + 24) as i64))]);
        assert_eq!(last, p.equity(&marks));
    }

    #[test]
    fn test_order_fills_apply_exactly_once() {
        let mut p = PortfolioState::new(dec!(1000));
        let partial = make_order(Side::Buy, dec!(1), dec!(100));
        assert!(Accountant::apply_order_fills(&mut p, &partial, &make_levels(), Utc::now()).is_some());
        assert!(Accountant::apply_order_fills(&mut p, &partial, &make_levels(), Utc::now()).is_none());
        assert_eq!(p.held("BTCUSDT"), dec!(1));

        // Second tranche at 110 moves the average to 105.
        let mut full = make_order(Side::Buy, dec!(2), dec!(105));
        full.status = OrderStatus::Filled;
        let delta = Accountant::apply_order_fills(&mut p, &full, &make_levels(), Utc::now()).unwrap();
        assert_eq!(delta.quantity, dec!(1));
        assert_eq!(delta.price, dec!(110));
        assert_eq!(p.held("BTCUSDT"), dec!(2));
        assert_eq!(p.cash, dec!(790));
        assert!(Accountant::apply_order_fills(&mut p, &full, &make_levels(), Utc::now()).is_none());
    }

    #[test]
    fn test_snapshot_valuation() {
        let mut p = PortfolioState::new(dec!(800));
        Accountant::apply_fill(&mut p, "BTCUSDT", Side::Buy, dec!(2), dec!(100), &make_levels(), Utc::now());
        let marks = BTreeMap::from([("BTCUSDT".to_string(), dec!(90))]);
        let snap = Accountant::snapshot(&p, marks, Utc::now());
        assert_eq!(snap.equity, dec!(780));
        assert_eq!(snap.unrealized_pnl, dec!(-20));
        assert_eq!(snap.exposure, dec!(200));
    }
}
