use serde::{Deserialize, Serialize};

use super::error::{SimError, SimResult};

const WEIGHT_TOLERANCE: f64 = 1e-9;

/// Target weights for the three asset classes. Always valid once built.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawAllocation")]
pub struct Allocation {
    stocks: f64,
    bonds: f64,
    cash: f64,
}

#[derive(Deserialize)]
struct RawAllocation {
    stocks: f64,
    bonds: f64,
    cash: f64,
}

impl TryFrom<RawAllocation> for Allocation {
    type Error = SimError;

    fn try_from(raw: RawAllocation) -> Result<Self, Self::Error> {
        Allocation::new(raw.stocks, raw.bonds, raw.cash)
    }
}

impl Allocation {
    pub fn new(stocks: f64, bonds: f64, cash: f64) -> SimResult<Self> {
        for (name, weight) in [("stocks", stocks), ("bonds", bonds), ("cash", cash)] {
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(SimError::InvalidAllocation(format!(
                    "{name} weight {weight} must be within [0, 1]"
                )));
            }
        }
        let total = stocks + bonds + cash;
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(SimError::InvalidAllocation(format!(
                "weights must sum to 1 (got {total})"
            )));
        }
        Ok(Self {
            stocks,
            bonds,
            cash,
        })
    }

    pub fn all_cash() -> Self {
        Self {
            stocks: 0.0,
            bonds: 0.0,
            cash: 1.0,
        }
    }

    pub fn stocks(&self) -> f64 {
        self.stocks
    }

    pub fn bonds(&self) -> f64 {
        self.bonds
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPortfolio")]
pub struct Portfolio {
    #[serde(rename = "portfolio_value")]
    value: f64,
    allocation: Allocation,
}

#[derive(Deserialize)]
struct RawPortfolio {
    portfolio_value: f64,
    allocation: Allocation,
}

impl TryFrom<RawPortfolio> for Portfolio {
    type Error = SimError;

    fn try_from(raw: RawPortfolio) -> Result<Self, Self::Error> {
        Portfolio::new(raw.portfolio_value, raw.allocation)
    }
}

impl Portfolio {
    pub fn new(value: f64, allocation: Allocation) -> SimResult<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(SimError::NegativePortfolio(value));
        }
        Ok(Self { value, allocation })
    }

    /// Rebuilds a portfolio from per-asset values.
    ///
    /// An all-zero portfolio gets an all-cash allocation. That allocation is a
    /// placeholder for a depleted portfolio, not an investment decision.
    pub fn from_values(stocks: f64, bonds: f64, cash: f64) -> SimResult<Self> {
        let value = stocks + bonds + cash;
        if value < 0.0 || !value.is_finite() {
            return Err(SimError::NegativePortfolio(value));
        }
        if value == 0.0 {
            return Ok(Self {
                value: 0.0,
                allocation: Allocation::all_cash(),
            });
        }
        let allocation = normalized_allocation(stocks / value, bonds / value, cash / value)?;
        Ok(Self { value, allocation })
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn allocation(&self) -> Allocation {
        self.allocation
    }

    pub fn stocks_value(&self) -> f64 {
        self.value * self.allocation.stocks
    }

    pub fn bonds_value(&self) -> f64 {
        self.value * self.allocation.bonds
    }

    pub fn cash_value(&self) -> f64 {
        self.value * self.allocation.cash
    }

    pub fn asset_values(&self) -> [f64; 3] {
        [self.stocks_value(), self.bonds_value(), self.cash_value()]
    }
}

// Ratios from a positive total can drift a few ulps away from summing to 1.
fn normalized_allocation(stocks: f64, bonds: f64, cash: f64) -> SimResult<Allocation> {
    let stocks = stocks.clamp(0.0, 1.0);
    let bonds = bonds.clamp(0.0, 1.0 - stocks);
    let cash = if cash > 0.0 {
        (1.0 - stocks - bonds).max(0.0)
    } else {
        0.0
    };
    Allocation::new(stocks, bonds, cash)
}

/// One simulated year of market conditions.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct MarketData {
    pub year_index: usize,
    pub stock_return: f64,
    pub bond_return: f64,
    pub cash_return: f64,
    pub inflation_rate: f64,
    /// Product of `1 + inflation_rate` over years `0..=year_index`.
    pub cumulative_inflation: f64,
}

impl MarketData {
    pub fn asset_returns(&self) -> [f64; 3] {
        [self.stock_return, self.bond_return, self.cash_return]
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct YearReturns {
    pub stock: f64,
    pub bond: f64,
    pub cash: f64,
    pub inflation: f64,
}

/// A full market path for one run.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scenario {
    years: Vec<MarketData>,
}

impl Scenario {
    pub fn from_returns<I>(returns: I) -> Self
    where
        I: IntoIterator<Item = YearReturns>,
    {
        let mut cumulative = 1.0;
        let years = returns
            .into_iter()
            .enumerate()
            .map(|(year_index, r)| {
                cumulative *= 1.0 + r.inflation;
                MarketData {
                    year_index,
                    stock_return: r.stock,
                    bond_return: r.bond,
                    cash_return: r.cash,
                    inflation_rate: r.inflation,
                    cumulative_inflation: cumulative,
                }
            })
            .collect();
        Self { years }
    }

    pub fn len(&self) -> usize {
        self.years.len()
    }

    pub fn is_empty(&self) -> bool {
        self.years.is_empty()
    }

    pub fn years(&self) -> &[MarketData] {
        &self.years
    }

    /// Market data up to and including `year_index`, never beyond.
    pub fn history(&self, year_index: usize) -> &[MarketData] {
        let end = (year_index + 1).min(self.years.len());
        &self.years[..end]
    }
}

/// Nominal to year-0 money.
pub fn deflate(nominal: f64, cumulative_inflation: f64) -> f64 {
    nominal / cumulative_inflation.max(1e-9)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct YearRecord {
    /// 1-based.
    pub year: u32,
    pub portfolio_value: f64,
    pub real_portfolio_value: f64,
    pub gross_income: f64,
    pub real_gross_income: f64,
    pub net_income: f64,
    pub real_net_income: f64,
    pub contribution: f64,
    pub real_contribution: f64,
    pub capital_gains_tax: f64,
    pub real_capital_gains_tax: f64,
    pub wealth_tax: f64,
    pub real_wealth_tax: f64,
    pub stock_return: f64,
    pub bond_return: f64,
    pub cash_return: f64,
    pub inflation_rate: f64,
    pub cumulative_inflation: f64,
    pub goal_achieved: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimulationReport {
    pub yearly_records: Vec<YearRecord>,
    pub goal_achieved: bool,
    pub final_portfolio_value: f64,
    pub final_real_portfolio_value: f64,
    /// Accumulation only: first year (1-based) the real target was met.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub years_to_target: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::{prop_assert, proptest};

    fn assert_close(actual: f64, expected: f64, tol: f64) {
        assert!(
            (actual - expected).abs() <= tol,
            "expected {expected}, got {actual}, tolerance {tol}"
        );
    }

    #[test]
    fn allocation_rejects_out_of_range_and_non_summing_weights() {
        assert!(Allocation::new(0.6, 0.3, 0.1).is_ok());
        assert!(Allocation::new(1.2, -0.2, 0.0).is_err());
        assert!(Allocation::new(0.5, 0.3, 0.1).is_err());
        assert!(Allocation::new(f64::NAN, 0.5, 0.5).is_err());
    }

    #[test]
    fn allocation_deserialization_validates() {
        let ok: Allocation =
            serde_json::from_str(r#"{"stocks":0.6,"bonds":0.3,"cash":0.1}"#).unwrap();
        assert_close(ok.stocks(), 0.6, 0.0);
        let over = r#"{"stocks":0.7,"bonds":0.3,"cash":0.1}"#;
        assert!(serde_json::from_str::<Allocation>(over).is_err());
        assert!(
            serde_json::from_str::<Portfolio>(
                r#"{"portfolio_value":-5,"allocation":{"stocks":1,"bonds":0,"cash":0}}"#
            )
            .is_err()
        );
    }

    #[test]
    fn from_values_with_all_zero_inputs_is_a_valid_empty_portfolio() {
        let portfolio = Portfolio::from_values(0.0, 0.0, 0.0).unwrap();
        assert_eq!(portfolio.value(), 0.0);
        let a = portfolio.allocation();
        assert_close(a.stocks() + a.bonds() + a.cash(), 1.0, 1e-9);
    }

    #[test]
    fn from_values_rejects_negative_total() {
        assert!(Portfolio::from_values(-10.0, 5.0, 0.0).is_err());
    }

    #[test]
    fn cumulative_inflation_compounds_through_each_year() {
        let scenario = Scenario::from_returns([0.02, 0.03, -0.01].map(|inflation| YearReturns {
            stock: 0.0,
            bond: 0.0,
            cash: 0.0,
            inflation,
        }));
        let years = scenario.years();
        assert_close(years[0].cumulative_inflation, 1.02, 1e-12);
        assert_close(years[1].cumulative_inflation, 1.02 * 1.03, 1e-12);
        assert_close(years[2].cumulative_inflation, 1.02 * 1.03 * 0.99, 1e-12);
        assert_eq!(scenario.history(1).len(), 2);
        assert_eq!(scenario.history(10).len(), 3);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(64))]

        #[test]
        fn prop_from_values_yields_valid_allocation(
            stocks in 0.0f64..1e7,
            bonds in 0.0f64..1e7,
            cash in 0.0f64..1e7,
        ) {
            let portfolio = Portfolio::from_values(stocks, bonds, cash).unwrap();
            let a = portfolio.allocation();
            prop_assert!((a.stocks() + a.bonds() + a.cash() - 1.0).abs() <= 1e-9);
            for w in [a.stocks(), a.bonds(), a.cash()] {
                prop_assert!((0.0..=1.0).contains(&w));
            }
            let total = stocks + bonds + cash;
            prop_assert!((portfolio.value() - total).abs() <= 1e-6);
            prop_assert!((portfolio.stocks_value() - stocks).abs() <= 1e-3);
        }
    }
}
