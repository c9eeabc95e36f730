//! Risk governor: capital-preservation state machine.
//!
//! ACTIVE passes decisions through, clamped to exposure and holdings.
//! THROTTLED (soft daily loss) scales BUY and SELL sizes down until a
//! cooldown passes without further loss. HALTED (hard drawdown, hard
//! daily loss, repeated cycle failures or an external kill) vetoes
//! everything until an operator reset.
//!
//! The governor is a cheap clonable handle; every clone sees the same
//! envelope. It is also the process-wide kill switch: the executor reads
//! `is_halted` right before each order submission.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{error, info, warn};

use crate::types::{
    Action, Adjustment, Decision, HaltCause, MarketView, PortfolioSnapshot, RiskEnvelope,
    RiskLimits, RiskState, RiskTransition, Verdict, VetoReason,
};

/// Decimal places kept when clamping a BUY to the exposure headroom.
const CLAMP_DECIMALS: u32 = 8;

#[derive(Debug, Clone)]
pub struct RiskGovernor {
    envelope: Arc<RwLock<RiskEnvelope>>,
}

impl RiskGovernor {
    pub fn new(limits: RiskLimits) -> Self {
        Self::from_envelope(RiskEnvelope::new(limits.clone()), limits)
    }

    /// Resume from a persisted envelope. Limits always come from the
    /// current configuration; state and loss tracking come from disk.
    pub fn from_envelope(mut envelope: RiskEnvelope, limits: RiskLimits) -> Self {
        envelope.limits = limits;
        Self {
            envelope: Arc::new(RwLock::new(envelope)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RiskEnvelope> {
        self.envelope.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RiskEnvelope> {
        self.envelope.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> RiskState {
        self.read().state
    }

    pub fn is_halted(&self) -> bool {
        self.state() == RiskState::Halted
    }

    /// Copy of the current envelope, for persistence and reporting.
    pub fn envelope(&self) -> RiskEnvelope {
        self.read().clone()
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Evaluate state transitions once per cycle against the cycle-start
    /// snapshot. Returns every transition taken (usually none).
    pub fn begin_cycle(&self, snapshot: &PortfolioSnapshot, now: DateTime<Utc>) -> Vec<RiskTransition> {
        let mut env = self.write();
        let mut transitions = Vec::new();
        let equity = snapshot.equity;

        let today = now.date_naive();
        if env.trading_day != Some(today) {
            info!(day = %today, equity = %equity, "New trading day, rebasing daily loss");
            env.trading_day = Some(today);
            env.day_start_equity = equity;
            env.loss_watermark = None;
        }
        if env.peak_equity < equity {
            env.peak_equity = equity;
        }

        if env.state == RiskState::Halted {
            return transitions;
        }

        let drawdown_pct = fraction_below(env.peak_equity, equity);
        let daily_pnl = equity - env.day_start_equity;
        let loss_pct = fraction_below(env.day_start_equity, equity);

        if drawdown_pct >= env.limits.max_drawdown_pct {
            transitions.extend(halt_locked(&mut env, HaltCause::Drawdown { drawdown_pct }, now));
            return transitions;
        }
        if loss_pct >= env.limits.max_daily_loss_pct {
            transitions.extend(halt_locked(&mut env, HaltCause::DailyLoss { loss_pct }, now));
            return transitions;
        }

        let further_loss = env.loss_watermark.map_or(true, |mark| daily_pnl < mark);
        let state = env.state;
        match state {
            RiskState::Active if loss_pct >= env.limits.soft_daily_loss_pct && further_loss => {
                env.state = RiskState::Throttled;
                env.throttled_since = Some(now);
                env.loss_watermark = Some(daily_pnl);
                let reason = format!(
                    "daily loss {:.2}% past soft limit {:.2}%",
                    loss_pct * Decimal::ONE_HUNDRED,
                    env.limits.soft_daily_loss_pct * Decimal::ONE_HUNDRED
                );
                warn!(%reason, "Risk governor throttled");
                transitions.push(RiskTransition {
                    from: RiskState::Active,
                    to: RiskState::Throttled,
                    reason,
                    at: now,
                });
            }
            RiskState::Throttled if further_loss => {
                info!(daily_pnl = %daily_pnl, "Further loss while throttled, cooldown restarted");
                env.loss_watermark = Some(daily_pnl);
                env.throttled_since = Some(now);
            }
            RiskState::Throttled => {
                let since = env.throttled_since.unwrap_or(now);
                let cooldown = chrono::Duration::seconds(env.limits.cooldown_secs as i64);
                if now - since >= cooldown {
                    env.state = RiskState::Active;
                    env.throttled_since = None;
                    let reason = format!("cooldown of {}s elapsed without further loss", env.limits.cooldown_secs);
                    info!(%reason, "Risk governor back to active");
                    transitions.push(RiskTransition {
                        from: RiskState::Throttled,
                        to: RiskState::Active,
                        reason,
                        at: now,
                    });
                }
            }
            _ => {}
        }
        transitions
    }

    /// Engage the kill switch. Returns `None` if already halted.
    pub fn halt(&self, cause: HaltCause, now: DateTime<Utc>) -> Option<RiskTransition> {
        halt_locked(&mut self.write(), cause, now)
    }

    /// Operator reset out of HALTED. Peak and day-start equity are rebased
    /// on the next cycle so the breach that caused the halt does not
    /// immediately re-trip it.
    pub fn reset(&self, operator: &str, now: DateTime<Utc>) -> Option<RiskTransition> {
        let mut env = self.write();
        if env.state != RiskState::Halted {
            return None;
        }
        let previous = env.halt_reason.take().unwrap_or_default();
        env.state = RiskState::Active;
        env.halted_since = None;
        env.throttled_since = None;
        env.loss_watermark = None;
        env.trading_day = None;
        env.peak_equity = Decimal::ZERO;
        warn!(operator, previous_reason = %previous, "Kill switch reset by operator");
        Some(RiskTransition {
            from: RiskState::Halted,
            to: RiskState::Active,
            reason: format!("reset by {operator}"),
            at: now,
        })
    }

    // -----------------------------------------------------------------------
    // Verdicts
    // -----------------------------------------------------------------------

    /// Evaluate a decision against the view it was made from. A stale view
    /// may still reduce risk but never sizes a BUY: its price can be far
    /// from where the exchange will fill.
    pub fn evaluate_view(&self, decision: &Decision, snapshot: &PortfolioSnapshot, view: &MarketView) -> Verdict {
        if view.stale && decision.action == Action::Buy && !self.is_halted() {
            warn!(
                cycle = decision.cycle_id,
                technical_age_ms = view.ages.technical_ms,
                "Refusing BUY on stale view"
            );
            return Verdict::Vetoed {
                reason: VetoReason::StaleView {
                    technical_age_ms: view.ages.technical_ms,
                },
            };
        }
        self.evaluate(decision, snapshot, view.price())
    }

    /// Approve, clamp or veto a decision. `price` is the view's price,
    /// needed to convert exposure headroom into a quantity.
    pub fn evaluate(&self, decision: &Decision, snapshot: &PortfolioSnapshot, price: Option<Decimal>) -> Verdict {
        let env = self.read();
        if env.state == RiskState::Halted {
            return Verdict::Vetoed {
                reason: VetoReason::Halted {
                    reason: env.halt_reason.clone().unwrap_or_else(|| "halted".to_string()),
                },
            };
        }

        let limits = &env.limits;
        let throttled = env.state == RiskState::Throttled;
        let held = snapshot.state.held(&decision.symbol);
        let mut adjustments = Vec::new();

        let size = match decision.action {
            Action::Hold => return Verdict::NoAction,
            Action::Buy => {
                let Some(price) = price else {
                    return Verdict::Vetoed { reason: VetoReason::NoPrice };
                };
                if held.is_zero() && snapshot.state.open_positions() >= limits.max_open_positions {
                    return Verdict::Vetoed {
                        reason: VetoReason::MaxOpenPositions {
                            limit: limits.max_open_positions,
                        },
                    };
                }
                let mut size = decision.target_size;
                if throttled {
                    size = throttle(size, limits.throttle_factor, &mut adjustments);
                }
                let room = limits.max_position_size - snapshot.exposure;
                if room <= Decimal::ZERO {
                    return Verdict::Vetoed {
                        reason: VetoReason::ExposureExhausted {
                            exposure: snapshot.exposure,
                            limit: limits.max_position_size,
                        },
                    };
                }
                let cap = (room / price).round_dp_with_strategy(CLAMP_DECIMALS, RoundingStrategy::ToZero);
                if size > cap {
                    adjustments.push(Adjustment::ClampedToExposure { from: size, to: cap });
                    size = cap;
                }
                size
            }
            Action::Sell => {
                if held.is_zero() {
                    return Verdict::Vetoed { reason: VetoReason::NothingToReduce };
                }
                let mut size = decision.target_size;
                if throttled {
                    size = throttle(size, limits.throttle_factor, &mut adjustments);
                }
                if size > held {
                    adjustments.push(Adjustment::ClampedToHolding { from: size, to: held });
                    size = held;
                }
                size
            }
            // Exits are never throttled.
            Action::Close => {
                if held.is_zero() {
                    return Verdict::Vetoed { reason: VetoReason::NothingToReduce };
                }
                if decision.target_size != held {
                    adjustments.push(Adjustment::ClampedToHolding {
                        from: decision.target_size,
                        to: held,
                    });
                }
                held
            }
        };

        // Dust is allowed when it empties the position.
        if size < limits.min_order_size && size != held {
            return Verdict::Vetoed {
                reason: VetoReason::BelowMinimumSize {
                    size,
                    minimum: limits.min_order_size,
                },
            };
        }
        if size <= Decimal::ZERO {
            return Verdict::Vetoed {
                reason: VetoReason::BelowMinimumSize {
                    size,
                    minimum: limits.min_order_size,
                },
            };
        }
        Verdict::Approved { size, adjustments }
    }
}

fn halt_locked(env: &mut RiskEnvelope, cause: HaltCause, now: DateTime<Utc>) -> Option<RiskTransition> {
    if env.state == RiskState::Halted {
        return None;
    }
    let from = env.state;
    let reason = cause.to_string();
    env.state = RiskState::Halted;
    env.halted_since = Some(now);
    env.halt_reason = Some(reason.clone());
    env.throttled_since = None;
    error!(from = %from, %reason, "KILL SWITCH ENGAGED");
    Some(RiskTransition {
        from,
        to: RiskState::Halted,
        reason,
        at: now,
    })
}

fn throttle(size: Decimal, factor: Decimal, adjustments: &mut Vec<Adjustment>) -> Decimal {
    let to = size * factor;
    adjustments.push(Adjustment::Throttled { factor, from: size, to });
    to
}

/// How far `value` sits below `reference`, as a fraction of `reference`.
fn fraction_below(reference: Decimal, value: Decimal) -> Decimal {
    if reference <= Decimal::ZERO || value >= reference {
        Decimal::ZERO
    } else {
        (reference - value) / reference
    }
}
