use tracing::{debug, warn};

use super::error::{SimError, SimResult};
use super::tax::TaxResult;

const INITIAL_EFFECTIVE_RATE: f64 = 0.3;
const MIN_SLOPE: f64 = 1e-6;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolverParams {
    /// Accepted absolute distance between achieved and target net income.
    pub tolerance: f64,
    pub max_iterations: u32,
}

impl Default for SolverParams {
    fn default() -> Self {
        Self {
            tolerance: 1e-2,
            max_iterations: 100,
        }
    }
}

/// Finds the gross income whose after-tax net matches `target_net`.
pub fn solve_gross_for_net<F>(
    calculate: F,
    target_net: f64,
    params: SolverParams,
) -> SimResult<TaxResult>
where
    F: Fn(f64) -> TaxResult,
{
    let mut gross = (target_net / (1.0 - INITIAL_EFFECTIVE_RATE)).max(0.0);
    let mut lo = 0.0_f64;
    let mut hi = f64::INFINITY;
    let mut previous_gap = f64::INFINITY;

    for iteration in 0..params.max_iterations {
        let result = calculate(gross);
        let gap = target_net - result.net_income;
        if gap.abs() <= params.tolerance {
            debug!(iteration, gross, target_net, "reverse tax converged");
            return Ok(result);
        }

        if gap > 0.0 {
            lo = lo.max(gross);
        } else {
            hi = hi.min(gross);
        }

        let slope = 1.0 - result.effective_tax_rate();
        let secant = gross + gap / slope;
        let stalled = gap.abs() > 0.5 * previous_gap && hi.is_finite();
        previous_gap = gap.abs();
        let usable = slope > MIN_SLOPE && secant.is_finite() && secant > lo && secant < hi;
        gross = if !stalled && usable {
            secant
        } else if hi.is_finite() {
            0.5 * (lo + hi)
        } else {
            (gross * 2.0).max(gross + gap.abs()).max(1.0)
        };
    }

    warn!(
        target_net,
        iterations = params.max_iterations,
        "reverse tax solver did not converge"
    );
    Err(SimError::DidNotConverge {
        net_income: target_net,
        iterations: params.max_iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tax::{
        Bracket, RegionTables, TaxConfig, TaxEngine, TaxRegistry, WealthTaxCap,
        WealthTaxExemptions,
    };
    use proptest::prelude::{prop_assert, proptest};

    fn spain(region: &str) -> TaxEngine {
        let registry = TaxRegistry::embedded().unwrap();
        TaxEngine::from_config(
            &TaxConfig {
                country: "spain".to_string(),
                region: region.to_string(),
                adjust_brackets_with_inflation: true,
            },
            &registry,
        )
        .unwrap()
    }

    #[test]
    fn no_tax_converges_immediately_to_the_target() {
        let result = TaxEngine::NoTax
            .solve_gross_for_net(35_000.0, 1e6, None, SolverParams::default())
            .unwrap();
        assert!((result.gross_income - 35_000.0).abs() <= 1e-2);
    }

    #[test]
    fn heavy_wealth_tax_relative_to_income_still_converges() {
        // At the first guess the wealth tax alone exceeds gross income, so
        // the effective rate is above 1 and the secant step is unusable.
        let engine = TaxEngine::Progressive {
            tables: RegionTables {
                capital_gains_brackets: vec![Bracket {
                    upper: None,
                    rate: 0.2,
                }],
                wealth_tax_brackets: vec![Bracket {
                    upper: None,
                    rate: 0.02,
                }],
                wealth_tax_exemptions: WealthTaxExemptions::default(),
                wealth_tax_cap: WealthTaxCap::default(),
            },
            adjust_for_inflation: false,
        };
        let result = engine
            .solve_gross_for_net(5_000.0, 5_000_000.0, None, SolverParams::default())
            .unwrap();
        assert!((result.net_income - 5_000.0).abs() <= 1e-2);
        assert!((result.gross_income - (5_000.0 + 100_000.0) / 0.8).abs() <= 1e-1);
    }

    #[test]
    fn unreachable_target_reports_non_convergence() {
        let err = solve_gross_for_net(
            |gross| TaxResult {
                wealth: 0.0,
                gross_income: gross,
                net_income: 0.0,
                capital_gains_tax: gross,
                wealth_tax: 0.0,
            },
            1_000.0,
            SolverParams {
                tolerance: 1e-2,
                max_iterations: 20,
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SimError::DidNotConverge {
                iterations: 20,
                ..
            }
        ));
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(96))]

        #[test]
        fn prop_solved_gross_reproduces_target_net(
            net in 0.0f64..400_000.0,
            wealth in 0.0f64..15_000_000.0,
            cumulative in 1.0f64..3.0,
        ) {
            for region in ["general", "madrid", "biscay"] {
                let engine = spain(region);
                let params = SolverParams::default();
                let solved = engine
                    .solve_gross_for_net(net, wealth, Some(cumulative), params)
                    .unwrap();
                let check = engine.calculate(solved.gross_income, wealth, Some(cumulative));
                prop_assert!((check.net_income - net).abs() <= params.tolerance);
            }
        }
    }
}
