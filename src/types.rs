//! Shared types for the HYDRA agent.
//!
//! These types form the data model used across all modules. Money,
//! prices and quantities are `Decimal`; indicator values, scores and
//! confidences are `f64`. Signal, strategy, risk and engine modules
//! all depend on this file and never on each other's internals.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// A value reported by a signal provider together with its observation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timestamped<T> {
    pub value: T,
    pub observed_at: DateTime<Utc>,
}

impl<T> Timestamped<T> {
    pub fn new(value: T, observed_at: DateTime<Utc>) -> Self {
        Self { value, observed_at }
    }

    /// Age of the observation relative to `now` (never negative).
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.observed_at).max(chrono::Duration::zero())
    }
}

/// Technical indicator set for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TechnicalSnapshot {
    pub price: f64,
    /// RSI(14), 0–100
    pub rsi: f64,
    /// EMA(50)
    pub ema_fast: f64,
    /// EMA(200)
    pub ema_slow: f64,
    pub bb_upper: f64,
    pub bb_lower: f64,
    pub macd: f64,
    pub macd_signal: f64,
    /// ADX(14), trend strength
    pub adx: f64,
}

impl TechnicalSnapshot {
    /// price > EMA50 > EMA200
    pub fn is_bullish_trend(&self) -> bool {
        self.price > self.ema_fast && self.ema_fast > self.ema_slow
    }

    /// price < EMA50 < EMA200
    pub fn is_bearish_trend(&self) -> bool {
        self.price < self.ema_fast && self.ema_fast < self.ema_slow
    }

    /// Helper to build a test snapshot with neutral readings.
    #[cfg(test)]
    pub fn sample() -> Self {
        TechnicalSnapshot {
            price: 100.0,
            rsi: 50.0,
            ema_fast: 100.0,
            ema_slow: 100.0,
            bb_upper: 104.0,
            bb_lower: 96.0,
            macd: 0.0,
            macd_signal: 0.0,
            adx: 25.0,
        }
    }
}

impl fmt::Display for TechnicalSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "price {:.2} | RSI {:.1} | EMA50 {:.2} | EMA200 {:.2} | ADX {:.1}",
            self.price, self.rsi, self.ema_fast, self.ema_slow, self.adx
        )
    }
}

/// Sentiment reading from the sentiment provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentReading {
    /// -1.0 (extreme panic) to 1.0 (euphoria)
    pub score: f64,
    /// Provider's own confidence in the reading (0.0–1.0)
    pub confidence: f64,
    /// Fear & greed index (0–100) if the provider reports one
    pub fear_greed: Option<u8>,
    pub summary: String,
}

impl SentimentReading {
    /// Build a reading, clamping score and confidence into range.
    pub fn new(score: f64, confidence: f64, summary: impl Into<String>) -> Self {
        let score = score.clamp(-1.0, 1.0);
        Self {
            score,
            confidence: confidence.clamp(0.0, 1.0),
            fear_greed: Some(((score + 1.0) * 50.0).round() as u8),
            summary: summary.into(),
        }
    }

    pub fn mood(&self) -> MarketMood {
        MarketMood::from_score(self.score)
    }
}

/// Coarse market mood derived from the sentiment score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarketMood {
    ExtremePanic,
    Fear,
    Neutral,
    Optimism,
    Euphoria,
}

impl MarketMood {
    pub fn from_score(score: f64) -> Self {
        if score <= -0.7 {
            MarketMood::ExtremePanic
        } else if score <= -0.3 {
            MarketMood::Fear
        } else if score <= 0.3 {
            MarketMood::Neutral
        } else if score <= 0.7 {
            MarketMood::Optimism
        } else {
            MarketMood::Euphoria
        }
    }
}

impl fmt::Display for MarketMood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketMood::ExtremePanic => write!(f, "extreme panic"),
            MarketMood::Fear => write!(f, "fear"),
            MarketMood::Neutral => write!(f, "neutral"),
            MarketMood::Optimism => write!(f, "optimism"),
            MarketMood::Euphoria => write!(f, "euphoria"),
        }
    }
}

// ---------------------------------------------------------------------------
// Market view
// ---------------------------------------------------------------------------

/// Age of each field of a market view, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldAges {
    pub technical_ms: i64,
    /// `None` when no sentiment has been reported yet.
    pub sentiment_ms: Option<i64>,
}

/// The merged, timestamped snapshot of signals for one cycle.
///
/// Built by the aggregator and never mutated afterwards. A cached view
/// reused by a later cycle is re-issued through [`MarketView::reissue_stale`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketView {
    pub symbol: String,
    pub cycle_id: u64,
    pub built_at: DateTime<Utc>,
    pub technical: TechnicalSnapshot,
    pub sentiment: Option<SentimentReading>,
    pub ages: FieldAges,
    /// Multiplier applied to sentiment confidence: 1.0 when fresh,
    /// lower once the reading is past its max age.
    pub sentiment_decay: f64,
    pub stale: bool,
}

impl MarketView {
    /// Re-issue this view for a later cycle, marked stale, with field
    /// ages advanced by the time elapsed since it was built.
    pub fn reissue_stale(&self, cycle_id: u64, now: DateTime<Utc>) -> MarketView {
        let elapsed = (now - self.built_at).num_milliseconds().max(0);
        MarketView {
            cycle_id,
            ages: FieldAges {
                technical_ms: self.ages.technical_ms + elapsed,
                sentiment_ms: self.ages.sentiment_ms.map(|ms| ms + elapsed),
            },
            stale: true,
            ..self.clone()
        }
    }

    /// Current price as a `Decimal`, if representable.
    pub fn price(&self) -> Option<Decimal> {
        Decimal::from_f64(self.technical.price).filter(|p| *p > Decimal::ZERO)
    }
}

impl fmt::Display for MarketView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} #{}] {}{}",
            self.symbol,
            self.cycle_id,
            self.technical,
            if self.stale { " (STALE)" } else { "" }
        )
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Trading action proposed by the strategy brain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Buy,
    Sell,
    Hold,
    Close,
}

impl Action {
    /// Order side that executes this action, `None` for HOLD.
    pub fn side(&self) -> Option<Side> {
        match self {
            Action::Buy => Some(Side::Buy),
            Action::Sell | Action::Close => Some(Side::Sell),
            Action::Hold => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Buy => "buy",
            Action::Sell => "sell",
            Action::Hold => "hold",
            Action::Close => "close",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Action::Buy),
            "sell" => Some(Action::Sell),
            "hold" => Some(Action::Hold),
            "close" => Some(Action::Close),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction a signal points in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
    Neutral,
}

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Neutral => Direction::Neutral,
        }
    }
}

/// Where a rationale entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSource {
    Technical,
    Sentiment,
    Protective,
    Conflict,
    Sizing,
    Gate,
}

/// One contributing signal in a decision's rationale trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RationaleEntry {
    pub source: SignalSource,
    pub direction: Direction,
    pub confidence: f64,
    pub detail: String,
}

impl RationaleEntry {
    pub fn new(
        source: SignalSource,
        direction: Direction,
        confidence: f64,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            source,
            direction,
            confidence,
            detail: detail.into(),
        }
    }
}

/// The strategy brain's proposed action for one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub cycle_id: u64,
    pub symbol: String,
    pub action: Action,
    /// Quantity in base units; zero for HOLD.
    pub target_size: Decimal,
    /// Confidence in the chosen action (0.0–1.0), populated for HOLD too.
    pub confidence: f64,
    /// Ordered list of contributing signals.
    pub rationale: Vec<RationaleEntry>,
    /// `built_at` of the view the decision was derived from.
    pub view_built_at: DateTime<Utc>,
}

impl Decision {
    /// Confidence recorded for a given source in the rationale trace.
    pub fn rationale_confidence(&self, source: SignalSource) -> Option<f64> {
        self.rationale
            .iter()
            .find(|e| e.source == source)
            .map(|e| e.confidence)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {} {} {} (conf {:.0}%)",
            self.cycle_id,
            self.action,
            self.target_size,
            self.symbol,
            self.confidence * 100.0
        )
    }
}

// ---------------------------------------------------------------------------
// Risk envelope
// ---------------------------------------------------------------------------

/// Risk governor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskState {
    Active,
    Throttled,
    Halted,
}

impl fmt::Display for RiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskState::Active => write!(f, "ACTIVE"),
            RiskState::Throttled => write!(f, "THROTTLED"),
            RiskState::Halted => write!(f, "HALTED"),
        }
    }
}

/// Capital-preservation limits. Percentages are fractions (0.05 = 5%).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskLimits {
    /// Maximum total open exposure (quantity × entry price).
    pub max_position_size: Decimal,
    /// Daily loss that moves ACTIVE to THROTTLED.
    pub soft_daily_loss_pct: Decimal,
    /// Daily loss that halts trading.
    pub max_daily_loss_pct: Decimal,
    /// Drawdown from peak equity that halts trading.
    pub max_drawdown_pct: Decimal,
    /// Size multiplier while THROTTLED.
    pub throttle_factor: Decimal,
    /// Time without further loss before THROTTLED reverts to ACTIVE.
    pub cooldown_secs: u64,
    pub max_open_positions: usize,
    /// Orders smaller than this are not worth placing.
    pub min_order_size: Decimal,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size: Decimal::from(5_000),
            soft_daily_loss_pct: Decimal::new(2, 2),
            max_daily_loss_pct: Decimal::new(5, 2),
            max_drawdown_pct: Decimal::new(10, 2),
            throttle_factor: Decimal::new(5, 1),
            cooldown_secs: 3_600,
            max_open_positions: 3,
            min_order_size: Decimal::new(1, 4),
        }
    }
}

/// Limits plus the kill-switch state machine and its loss tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEnvelope {
    pub limits: RiskLimits,
    pub state: RiskState,
    pub halted_since: Option<DateTime<Utc>>,
    pub halt_reason: Option<String>,
    pub throttled_since: Option<DateTime<Utc>>,
    pub trading_day: Option<NaiveDate>,
    pub day_start_equity: Decimal,
    pub peak_equity: Decimal,
    /// Worst daily PnL seen while throttled; a lower value restarts the cooldown.
    pub loss_watermark: Option<Decimal>,
}

impl RiskEnvelope {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            state: RiskState::Active,
            halted_since: None,
            halt_reason: None,
            throttled_since: None,
            trading_day: None,
            day_start_equity: Decimal::ZERO,
            peak_equity: Decimal::ZERO,
            loss_watermark: None,
        }
    }
}

/// Why the governor halted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HaltCause {
    Drawdown { drawdown_pct: Decimal },
    DailyLoss { loss_pct: Decimal },
    ConsecutiveFailures { count: u32 },
    External { source: String },
}

impl fmt::Display for HaltCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltCause::Drawdown { drawdown_pct } => write!(
                f,
                "drawdown {:.2}% breached hard limit",
                drawdown_pct * Decimal::ONE_HUNDRED
            ),
            HaltCause::DailyLoss { loss_pct } => write!(
                f,
                "daily loss {:.2}% breached hard limit",
                loss_pct * Decimal::ONE_HUNDRED
            ),
            HaltCause::ConsecutiveFailures { count } => {
                write!(f, "{count} consecutive cycle failures")
            }
            HaltCause::External { source } => write!(f, "external kill signal ({source})"),
        }
    }
}

/// A state change of the risk governor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskTransition {
    pub from: RiskState,
    pub to: RiskState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for RiskTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.from, self.to, self.reason)
    }
}

/// Size change applied by the governor to an approved decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Adjustment {
    Throttled { factor: Decimal, from: Decimal, to: Decimal },
    ClampedToExposure { from: Decimal, to: Decimal },
    ClampedToHolding { from: Decimal, to: Decimal },
}

/// Why the governor refused a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VetoReason {
    Halted { reason: String },
    ExposureExhausted { exposure: Decimal, limit: Decimal },
    MaxOpenPositions { limit: usize },
    NothingToReduce,
    BelowMinimumSize { size: Decimal, minimum: Decimal },
    NoPrice,
    /// BUYs are not sized off a cached view.
    StaleView { technical_age_ms: i64 },
}

impl fmt::Display for VetoReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VetoReason::Halted { reason } => write!(f, "kill switch active: {reason}"),
            VetoReason::ExposureExhausted { exposure, limit } => {
                write!(f, "exposure {exposure} already at limit {limit}")
            }
            VetoReason::MaxOpenPositions { limit } => {
                write!(f, "max open positions ({limit}) reached")
            }
            VetoReason::NothingToReduce => write!(f, "no position to reduce"),
            VetoReason::BelowMinimumSize { size, minimum } => {
                write!(f, "size {size} below minimum {minimum}")
            }
            VetoReason::NoPrice => write!(f, "market view has no usable price"),
            VetoReason::StaleView { technical_age_ms } => {
                write!(f, "view is stale (technical data {technical_age_ms}ms old)")
            }
        }
    }
}

/// The governor's verdict on a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Approved {
        size: Decimal,
        adjustments: Vec<Adjustment>,
    },
    Vetoed {
        reason: VetoReason,
    },
    /// HOLD decisions need no approval.
    NoAction,
}

impl Verdict {
    pub fn approved_size(&self) -> Option<Decimal> {
        match self {
            Verdict::Approved { size, .. } => Some(*size),
            _ => None,
        }
    }

    pub fn is_vetoed(&self) -> bool {
        matches!(self, Verdict::Vetoed { .. })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Approved { size, adjustments } if adjustments.is_empty() => {
                write!(f, "APPROVED {size}")
            }
            Verdict::Approved { size, adjustments } => {
                write!(f, "APPROVED {size} ({} adjustment(s))", adjustments.len())
            }
            Verdict::Vetoed { reason } => write!(f, "VETOED: {reason}"),
            Verdict::NoAction => write!(f, "NO ACTION"),
        }
    }
}

// ---------------------------------------------------------------------------
// Portfolio
// ---------------------------------------------------------------------------

/// An open long position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    /// Weighted-average entry price.
    pub entry_price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Risk carried by the position: quantity × entry price.
    pub fn notional(&self) -> Decimal {
        self.quantity * self.entry_price
    }

    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        (mark - self.entry_price) * self.quantity
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} @ {}", self.quantity, self.symbol, self.entry_price)
    }
}

/// One point of the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub at: DateTime<Utc>,
    pub equity: Decimal,
}

/// Fill quantity and notional already reconciled for one order.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct AppliedFill {
    pub quantity: Decimal,
    pub notional: Decimal,
}

/// Cash, positions and PnL. Only the execution coordinator writes this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash: Decimal,
    pub positions: BTreeMap<String, Position>,
    pub realized_pnl: Decimal,
    pub equity_curve: Vec<EquityPoint>,
    /// Order id → fills already applied, so reconciliation is exactly-once.
    #[serde(default)]
    pub applied_fills: BTreeMap<String, AppliedFill>,
}

impl PortfolioState {
    pub fn new(cash: Decimal) -> Self {
        Self {
            cash,
            positions: BTreeMap::new(),
            realized_pnl: Decimal::ZERO,
            equity_curve: Vec::new(),
            applied_fills: BTreeMap::new(),
        }
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Quantity held in `symbol` (zero when flat).
    pub fn held(&self, symbol: &str) -> Decimal {
        self.positions
            .get(symbol)
            .map(|p| p.quantity)
            .unwrap_or(Decimal::ZERO)
    }

    /// Sum of open-position notional at entry.
    pub fn exposure(&self) -> Decimal {
        self.positions.values().map(Position::notional).sum()
    }

    pub fn open_positions(&self) -> usize {
        self.positions.len()
    }

    /// Cash plus positions valued at `marks`, falling back to entry price.
    pub fn equity(&self, marks: &BTreeMap<String, Decimal>) -> Decimal {
        self.cash
            + self
                .positions
                .values()
                .map(|p| p.quantity * marks.get(&p.symbol).copied().unwrap_or(p.entry_price))
                .sum::<Decimal>()
    }

    /// Fills already applied for an order.
    pub fn applied(&self, order_id: &str) -> AppliedFill {
        self.applied_fills.get(order_id).copied().unwrap_or_default()
    }
}

/// Immutable valuation of the portfolio taken at cycle start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    pub state: PortfolioState,
    pub marks: BTreeMap<String, Decimal>,
    pub equity: Decimal,
    pub unrealized_pnl: Decimal,
    pub exposure: Decimal,
    pub taken_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Failed,
}

impl OrderStatus {
    /// FILLED, CANCELLED and REJECTED never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "PARTIALLY_FILLED" => Some(OrderStatus::PartiallyFilled),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Components of an idempotency key: `hx-{cycle}-{symbol}-{action}-{seq}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderKey {
    pub cycle_id: u64,
    pub symbol: String,
    pub action: Action,
    pub seq: u32,
}

impl OrderKey {
    pub fn new(cycle_id: u64, symbol: &str, action: Action, seq: u32) -> Self {
        Self {
            cycle_id,
            symbol: symbol.to_string(),
            action,
            seq,
        }
    }

    /// Parse a key produced by `Display`. Symbols may contain dashes.
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("hx-")?;
        let (cycle, rest) = rest.split_once('-')?;
        let mut tail = rest.rsplitn(3, '-');
        let seq = tail.next()?.parse().ok()?;
        let action = Action::parse(tail.next()?)?;
        let symbol = tail.next()?;
        if symbol.is_empty() {
            return None;
        }
        Some(Self {
            cycle_id: cycle.parse().ok()?,
            symbol: symbol.to_string(),
            action,
            seq,
        })
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hx-{}-{}-{}-{}",
            self.cycle_id,
            self.symbol,
            self.action.as_str(),
            self.seq
        )
    }
}

/// An exchange order. `id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub cycle_id: u64,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub filled_quantity: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub status: OrderStatus,
    pub retry_count: u32,
    pub reject_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// A new order that has not yet been sent to the exchange.
    pub fn pending(key: &OrderKey, side: Side, quantity: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            id: key.to_string(),
            cycle_id: key.cycle_id,
            symbol: key.symbol.clone(),
            side,
            quantity,
            filled_quantity: Decimal::ZERO,
            avg_fill_price: None,
            status: OrderStatus::Pending,
            retry_count: 0,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, refusing to leave a terminal status.
    pub fn transition(&mut self, next: OrderStatus, at: DateTime<Utc>) -> Result<(), HydraError> {
        if self.status == next {
            return Ok(());
        }
        if self.status.is_terminal() {
            return Err(HydraError::IllegalTransition {
                order_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// Adopt the exchange's view of this order: status, filled quantity
    /// and average price. Filled quantity never decreases. Returns whether
    /// anything changed.
    pub fn absorb(&mut self, reported: &Order, at: DateTime<Utc>) -> Result<bool, HydraError> {
        let status = match reported.status {
            OrderStatus::Pending => OrderStatus::Submitted,
            s => s,
        };
        let filled = reported.filled_quantity.max(self.filled_quantity);
        let changed = status != self.status
            || filled != self.filled_quantity
            || reported.avg_fill_price != self.avg_fill_price;
        if !changed {
            return Ok(false);
        }
        if self.status.is_terminal() {
            return Err(HydraError::IllegalTransition {
                order_id: self.id.clone(),
                from: self.status,
                to: status,
            });
        }
        self.filled_quantity = filled;
        if reported.avg_fill_price.is_some() {
            self.avg_fill_price = reported.avg_fill_price;
        }
        if reported.reject_reason.is_some() {
            self.reject_reason = reported.reject_reason.clone();
        }
        self.status = status;
        self.updated_at = at;
        Ok(true)
    }

    pub fn remaining(&self) -> Decimal {
        (self.quantity - self.filled_quantity).max(Decimal::ZERO)
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} [{}] filled {}",
            self.id, self.side, self.quantity, self.symbol, self.status, self.filled_quantity
        )
    }
}

/// What the coordinator did with an approved decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub orders: Vec<Order>,
    pub filled_quantity: Decimal,
    /// The action that actually took effect; HOLD when nothing filled.
    pub effective_action: Action,
    pub rejection: Option<String>,
    /// Retries exhausted on at least one order.
    pub failed: bool,
    pub blocked_by_kill_switch: bool,
    pub deadline_hit: bool,
    /// Remaining chunks dropped because confirmed fill prices used up the
    /// exposure headroom.
    #[serde(default)]
    pub exposure_capped: bool,
    /// Orders left open for the reconciliation pass.
    pub open_order_ids: Vec<String>,
}

impl ExecutionOutcome {
    pub fn empty() -> Self {
        Self {
            orders: Vec::new(),
            filled_quantity: Decimal::ZERO,
            effective_action: Action::Hold,
            rejection: None,
            failed: false,
            blocked_by_kill_switch: false,
            deadline_hit: false,
            exposure_capped: false,
            open_order_ids: Vec::new(),
        }
    }
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} order(s), filled {}, effective {}",
            self.orders.len(),
            self.filled_quantity,
            self.effective_action
        )?;
        if let Some(ref r) = self.rejection {
            write!(f, ", rejected: {r}")?;
        }
        if self.blocked_by_kill_switch {
            write!(f, ", blocked by kill switch")?;
        }
        if self.exposure_capped {
            write!(f, ", capped at exposure limit")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Forensic record
// ---------------------------------------------------------------------------

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    Executed,
    NoAction,
    Vetoed,
    /// Exchange rejected the order(s); recorded as HOLD-equivalent.
    Rejected,
    Skipped,
    Failed,
    Interrupted,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleOutcome::Executed => "executed",
            CycleOutcome::NoAction => "no action",
            CycleOutcome::Vetoed => "vetoed",
            CycleOutcome::Rejected => "rejected",
            CycleOutcome::Skipped => "skipped",
            CycleOutcome::Failed => "failed",
            CycleOutcome::Interrupted => "interrupted",
        };
        write!(f, "{s}")
    }
}

/// One append-only forensic record per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub session_id: String,
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stale: bool,
    pub risk_state_before: RiskState,
    pub risk_state_after: RiskState,
    pub transitions: Vec<RiskTransition>,
    pub view: Option<MarketView>,
    pub decision: Option<Decision>,
    pub verdict: Option<Verdict>,
    pub execution: Option<ExecutionOutcome>,
    pub outcome: CycleOutcome,
    pub errors: Vec<String>,
}

impl CycleRecord {
    pub fn new(session_id: &str, cycle_id: u64, risk_state: RiskState, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_string(),
            cycle_id,
            started_at: now,
            finished_at: None,
            stale: false,
            risk_state_before: risk_state,
            risk_state_after: risk_state,
            transitions: Vec::new(),
            view: None,
            decision: None,
            verdict: None,
            execution: None,
            outcome: CycleOutcome::NoAction,
            errors: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome == CycleOutcome::Failed
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Domain errors for the HYDRA agent.
#[derive(Debug, Error)]
pub enum HydraError {
    #[error("Invariant violated in cycle {cycle_id}: {message}")]
    Invariant { cycle_id: u64, message: String },

    #[error("Illegal order transition for {order_id}: {from} -> {to}")]
    IllegalTransition {
        order_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
