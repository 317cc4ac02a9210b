use serde::{Deserialize, Serialize};

use super::error::SimResult;
use super::types::{MarketData, Portfolio};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy_type", rename_all = "snake_case")]
pub enum StrategyConfig {
    FixedSwr(FixedSwrConfig),
    ConstantDollar(ConstantDollarConfig),
    #[serde(rename = "hebeler_autopilot_ii")]
    HebelerAutopilot(HebelerAutopilotConfig),
    CashBuffer(CashBufferConfig),
}

/// Every money amount below is in year-0 money and is scaled by cumulative
/// inflation in the year it is applied.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FixedSwrConfig {
    #[serde(default = "default_withdrawal_rate")]
    pub withdrawal_rate: f64,
    #[serde(default)]
    pub minimum_withdrawal: f64,
    #[serde(default)]
    pub maximum_withdrawal: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConstantDollarConfig {
    pub withdrawal_amount: f64,
    #[serde(default)]
    pub maximum_withdrawal: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HebelerAutopilotConfig {
    #[serde(default = "default_withdrawal_rate")]
    pub initial_withdrawal_rate: f64,
    /// Weight of last year's inflation-escalated withdrawal in the blend.
    #[serde(default = "default_previous_weight")]
    pub previous_withdrawal_weight: f64,
    #[serde(default = "default_payout_years")]
    pub payout_years: u32,
    #[serde(default)]
    pub minimum_withdrawal: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CashBufferConfig {
    /// Real return each risky asset must clear before its gains are spendable.
    pub withdrawal_rate_buffer: f64,
    pub subsistence_withdrawal: f64,
    pub standard_withdrawal: f64,
    pub maximum_withdrawal: f64,
    pub buffer_target: f64,
}

fn default_withdrawal_rate() -> f64 {
    0.04
}

fn default_previous_weight() -> f64 {
    0.75
}

fn default_payout_years() -> u32 {
    30
}

/// Cross-year memory for one strategy within one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StrategyState {
    pub previous_withdrawal: Option<f64>,
    pub years_withdrawn: u32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StrategyDecision {
    pub withdrawal: f64,
    pub portfolio: Portfolio,
}

impl StrategyConfig {
    pub fn strategy_type(&self) -> &'static str {
        match self {
            Self::FixedSwr(_) => "fixed_swr",
            Self::ConstantDollar(_) => "constant_dollar",
            Self::HebelerAutopilot(_) => "hebeler_autopilot_ii",
            Self::CashBuffer(_) => "cash_buffer",
        }
    }

    /// Nominal spend that counts as meeting the goal this year.
    pub fn spend_target(&self, market: &MarketData) -> f64 {
        let real = match self {
            Self::FixedSwr(c) => c.minimum_withdrawal,
            Self::ConstantDollar(c) => c.withdrawal_amount,
            Self::HebelerAutopilot(c) => c.minimum_withdrawal,
            Self::CashBuffer(c) => c.subsistence_withdrawal,
        };
        real * market.cumulative_inflation
    }

    /// Decides this year's withdrawal.
    ///
    /// `history` ends with the current year. `before` is the portfolio at the
    /// start of the year, `after` the same portfolio once returns are applied.
    pub fn decide(
        &self,
        before: &Portfolio,
        after: &Portfolio,
        history: &[MarketData],
        state: &mut StrategyState,
    ) -> SimResult<StrategyDecision> {
        let Some(market) = history.last() else {
            return Ok(StrategyDecision {
                withdrawal: 0.0,
                portfolio: *after,
            });
        };
        let cum = market.cumulative_inflation;

        let decision = match self {
            Self::FixedSwr(c) => {
                let amount = clamp_to_bounds(
                    after.value() * c.withdrawal_rate,
                    c.minimum_withdrawal * cum,
                    c.maximum_withdrawal.map(|m| m * cum),
                );
                withdraw_pro_rata(after, amount)?
            }
            Self::ConstantDollar(c) => {
                let target = c.withdrawal_amount * cum;
                let amount = clamp_to_bounds(target, target, c.maximum_withdrawal.map(|m| m * cum));
                withdraw_pro_rata(after, amount)?
            }
            Self::HebelerAutopilot(c) => {
                let amount = hebeler_amount(c, before, after, history, state);
                withdraw_pro_rata(after, amount)?
            }
            Self::CashBuffer(c) => cash_buffer_decision(c, before, after, market)?,
        };

        state.previous_withdrawal = Some(decision.withdrawal);
        state.years_withdrawn += 1;
        Ok(decision)
    }
}

/// The floor wins over the ceiling when the two conflict.
fn clamp_to_bounds(amount: f64, floor: f64, ceiling: Option<f64>) -> f64 {
    let capped = ceiling.map_or(amount, |ceiling| amount.min(ceiling));
    capped.max(floor)
}

fn withdraw_pro_rata(portfolio: &Portfolio, amount: f64) -> SimResult<StrategyDecision> {
    let withdrawal = amount.clamp(0.0, portfolio.value());
    Ok(StrategyDecision {
        withdrawal,
        portfolio: Portfolio::new(
            (portfolio.value() - withdrawal).max(0.0),
            portfolio.allocation(),
        )?,
    })
}

fn hebeler_amount(
    config: &HebelerAutopilotConfig,
    before: &Portfolio,
    after: &Portfolio,
    history: &[MarketData],
    state: &StrategyState,
) -> f64 {
    let floor = config.minimum_withdrawal * history.last().map_or(1.0, |m| m.cumulative_inflation);
    let Some(previous) = state.previous_withdrawal else {
        return (after.value() * config.initial_withdrawal_rate).max(floor);
    };

    let inflation = history.last().map_or(0.0, |m| m.inflation_rate);
    let escalated = previous * (1.0 + inflation);

    let remaining = config.payout_years.saturating_sub(state.years_withdrawn).max(1);
    let real_return = average_real_return(before, history);
    let pmt = after.value() * annuity_withdrawal_rate(real_return, remaining);

    let weight = config.previous_withdrawal_weight.clamp(0.0, 1.0);
    let blended = weight * escalated + (1.0 - weight) * pmt;
    blended.min(escalated).max(floor)
}

fn average_real_return(portfolio: &Portfolio, history: &[MarketData]) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let a = portfolio.allocation();
    let total: f64 = history
        .iter()
        .map(|m| {
            let nominal =
                a.stocks() * m.stock_return + a.bonds() * m.bond_return + a.cash() * m.cash_return;
            (1.0 + nominal) / (1.0 + m.inflation_rate).max(1e-9) - 1.0
        })
        .sum();
    total / history.len() as f64
}

/// Fraction of the balance that pays out evenly over `years_remaining` years
/// at `real_return`.
fn annuity_withdrawal_rate(real_return: f64, years_remaining: u32) -> f64 {
    let years = years_remaining.max(1) as f64;
    if real_return.abs() < 1e-9 {
        return (1.0 / years).clamp(0.0, 1.0);
    }

    if real_return <= -1.0 {
        return 0.0;
    }

    let rate = real_return / (1.0 - (1.0 + real_return).powf(-years));
    if rate.is_finite() {
        rate.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn cash_buffer_decision(
    config: &CashBufferConfig,
    before: &Portfolio,
    after: &Portfolio,
    market: &MarketData,
) -> SimResult<StrategyDecision> {
    let cum = market.cumulative_inflation;
    let subsistence = config.subsistence_withdrawal * cum;
    let standard = config.standard_withdrawal * cum;
    let maximum = (config.maximum_withdrawal * cum).max(standard);
    let buffer_target = config.buffer_target * cum;

    let hurdle = market.inflation_rate + config.withdrawal_rate_buffer;
    let excess_stocks = ((market.stock_return - hurdle).max(0.0) * before.stocks_value())
        .min(after.stocks_value().max(0.0));
    let excess_bonds = ((market.bond_return - hurdle).max(0.0) * before.bonds_value())
        .min(after.bonds_value().max(0.0));
    let pool = excess_stocks + excess_bonds;

    let mut stocks = (after.stocks_value() - excess_stocks).max(0.0);
    let mut bonds = (after.bonds_value() - excess_bonds).max(0.0);
    let mut cash = after.cash_value().max(0.0);

    let fullness = if buffer_target > 0.0 {
        (cash / buffer_target).clamp(0.0, 1.0)
    } else {
        1.0
    };

    let withdrawal = if pool >= standard {
        let spendable = pool.min(maximum);
        let overflow = pool - spendable;
        let discretionary = spendable - standard;
        let top_up = discretionary * (1.0 - fullness);
        cash += overflow + top_up;
        standard + discretionary - top_up
    } else if pool >= subsistence {
        let from_buffer = ((standard - pool) * fullness).min(cash);
        cash -= from_buffer;
        pool + from_buffer
    } else {
        let shortfall = subsistence - pool;
        let from_buffer = shortfall.min(cash);
        cash -= from_buffer;
        let from_risky = (shortfall - from_buffer).min(stocks + bonds);
        if from_risky > 0.0 {
            let risky = stocks + bonds;
            stocks -= from_risky * stocks / risky;
            bonds -= from_risky * bonds / risky;
        }
        pool + from_buffer + from_risky
    };

    let portfolio = Portfolio::from_values(stocks.max(0.0), bonds.max(0.0), cash.max(0.0))?;
    let withdrawal = withdrawal.clamp(0.0, after.value().max(0.0));
    Ok(StrategyDecision {
        withdrawal,
        portfolio,
    })
}
