use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::error::{SimError, SimResult};
use super::solver::{SolverParams, solve_gross_for_net};

const EMBEDDED_TAX_REGIONS: &str = include_str!("../../data/tax_regions.json");
const NO_TAX_COUNTRY: &str = "none";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaxConfig {
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub adjust_brackets_with_inflation: bool,
}

impl TaxConfig {
    pub fn none() -> Self {
        Self {
            country: NO_TAX_COUNTRY.to_string(),
            region: String::new(),
            adjust_brackets_with_inflation: false,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
pub struct TaxResult {
    pub wealth: f64,
    pub gross_income: f64,
    pub net_income: f64,
    pub capital_gains_tax: f64,
    pub wealth_tax: f64,
}

impl TaxResult {
    pub fn total_tax(&self) -> f64 {
        self.capital_gains_tax + self.wealth_tax
    }

    pub fn effective_tax_rate(&self) -> f64 {
        if self.gross_income == 0.0 {
            0.0
        } else {
            self.total_tax() / self.gross_income
        }
    }
}

/// One marginal band. `upper = None` is unbounded.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bracket {
    #[serde(rename = "bracket")]
    pub upper: Option<f64>,
    pub rate: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WealthTaxExemptions {
    #[serde(default)]
    pub personal_allowance: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WealthTaxCap {
    #[serde(default = "default_cap_pct")]
    pub pct_of_taxable_income: f64,
    #[serde(default)]
    pub discount_limit_pct: f64,
}

impl Default for WealthTaxCap {
    fn default() -> Self {
        Self {
            pct_of_taxable_income: default_cap_pct(),
            discount_limit_pct: 0.0,
        }
    }
}

fn default_cap_pct() -> f64 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegionTables {
    pub capital_gains_brackets: Vec<Bracket>,
    pub wealth_tax_brackets: Vec<Bracket>,
    #[serde(default)]
    pub wealth_tax_exemptions: WealthTaxExemptions,
    #[serde(default)]
    pub wealth_tax_cap: WealthTaxCap,
}

impl RegionTables {
    fn validate(&self, country: &str, region: &str) -> SimResult<()> {
        for (name, brackets) in [
            ("capital_gains_brackets", &self.capital_gains_brackets),
            ("wealth_tax_brackets", &self.wealth_tax_brackets),
        ] {
            validate_brackets(brackets)
                .map_err(|msg| SimError::TaxTables(format!("{country}/{region} {name}: {msg}")))?;
        }
        let cap = &self.wealth_tax_cap;
        if !(0.0..=1.0).contains(&cap.discount_limit_pct) || cap.pct_of_taxable_income < 0.0 {
            return Err(SimError::TaxTables(format!(
                "{country}/{region}: wealth_tax_cap out of range"
            )));
        }
        Ok(())
    }
}

fn validate_brackets(brackets: &[Bracket]) -> Result<(), String> {
    let mut previous = 0.0;
    for (i, bracket) in brackets.iter().enumerate() {
        if !(0.0..=1.0).contains(&bracket.rate) {
            return Err(format!("rate {} outside [0, 1]", bracket.rate));
        }
        match bracket.upper {
            Some(upper) if upper < previous => {
                return Err(format!("bound {upper} below previous bound {previous}"));
            }
            Some(upper) => previous = upper,
            None if i + 1 != brackets.len() => {
                return Err("only the last bracket may be unbounded".to_string());
            }
            None => {}
        }
    }
    Ok(())
}

#[derive(Clone, Debug, Default, Deserialize)]
struct CountryTables {
    #[serde(default)]
    regions: HashMap<String, RegionTables>,
}

/// Bracket tables keyed by country then region.
#[derive(Clone, Debug, Default)]
pub struct TaxRegistry {
    countries: HashMap<String, CountryTables>,
}

impl TaxRegistry {
    /// Tables compiled into the binary from `data/tax_regions.json`.
    pub fn embedded() -> SimResult<Self> {
        Self::from_json(EMBEDDED_TAX_REGIONS)
    }

    pub fn from_json(raw: &str) -> SimResult<Self> {
        let countries: HashMap<String, CountryTables> =
            serde_json::from_str(raw).map_err(|e| SimError::TaxTables(e.to_string()))?;
        for (country, tables) in &countries {
            for (region, region_tables) in &tables.regions {
                region_tables.validate(country, region)?;
            }
        }
        Ok(Self { countries })
    }

    /// Country to sorted region names, as offered to clients.
    pub fn regions(&self) -> BTreeMap<String, Vec<String>> {
        self.countries
            .iter()
            .map(|(country, tables)| {
                let mut regions: Vec<String> = tables.regions.keys().cloned().collect();
                regions.sort();
                (country.clone(), regions)
            })
            .collect()
    }

    pub fn region(&self, country: &str, region: &str) -> SimResult<&RegionTables> {
        let tables = self
            .countries
            .get(country)
            .ok_or_else(|| SimError::UnknownTaxCountry(country.to_string()))?;
        tables
            .regions
            .get(region)
            .ok_or_else(|| SimError::UnknownTaxRegion {
                country: country.to_string(),
                region: region.to_string(),
            })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaxEngine {
    NoTax,
    Progressive {
        tables: RegionTables,
        adjust_for_inflation: bool,
    },
}

impl TaxEngine {
    pub fn from_config(config: &TaxConfig, registry: &TaxRegistry) -> SimResult<Self> {
        let country = config.country.to_lowercase();
        if country == NO_TAX_COUNTRY {
            return Ok(Self::NoTax);
        }
        let tables = registry.region(&country, &config.region)?;
        Ok(Self::Progressive {
            tables: tables.clone(),
            adjust_for_inflation: config.adjust_brackets_with_inflation,
        })
    }

    pub fn calculate(
        &self,
        gross_income: f64,
        wealth: f64,
        cumulative_inflation: Option<f64>,
    ) -> TaxResult {
        let (tables, adjust_for_inflation) = match self {
            Self::NoTax => {
                return TaxResult {
                    wealth,
                    gross_income,
                    net_income: gross_income,
                    capital_gains_tax: 0.0,
                    wealth_tax: 0.0,
                };
            }
            Self::Progressive {
                tables,
                adjust_for_inflation,
            } => (tables, *adjust_for_inflation),
        };

        let scale = match cumulative_inflation {
            Some(factor) if adjust_for_inflation => factor,
            _ => 1.0,
        };

        let capital_gains_tax =
            progressive_tax(gross_income, &tables.capital_gains_brackets, scale);

        let allowance = tables.wealth_tax_exemptions.personal_allowance * scale;
        let taxable_wealth = (wealth - allowance).max(0.0);
        let mut wealth_tax = progressive_tax(taxable_wealth, &tables.wealth_tax_brackets, scale);

        let cap = tables.wealth_tax_cap;
        let max_tax = gross_income * cap.pct_of_taxable_income;
        if capital_gains_tax + wealth_tax > max_tax {
            wealth_tax = (max_tax - capital_gains_tax)
                .max(wealth_tax * (1.0 - cap.discount_limit_pct));
        }

        TaxResult {
            wealth,
            gross_income,
            net_income: gross_income - capital_gains_tax - wealth_tax,
            capital_gains_tax,
            wealth_tax,
        }
    }

    /// Gross income whose net equals `net_income`, within the solver tolerance.
    pub fn solve_gross_for_net(
        &self,
        net_income: f64,
        wealth: f64,
        cumulative_inflation: Option<f64>,
        params: SolverParams,
    ) -> SimResult<TaxResult> {
        solve_gross_for_net(
            |gross| self.calculate(gross, wealth, cumulative_inflation),
            net_income,
            params,
        )
    }
}

/// Fills brackets bottom-up. Every bound is multiplied by `scale`.
pub fn progressive_tax(taxable: f64, brackets: &[Bracket], scale: f64) -> f64 {
    if taxable <= 0.0 {
        return 0.0;
    }

    let mut tax = 0.0;
    let mut remaining = taxable;
    let mut previous = 0.0;
    for bracket in brackets {
        if remaining <= 0.0 {
            break;
        }
        let slice = match bracket.upper {
            Some(upper) => {
                let upper = upper * scale;
                let slice = (upper - previous).min(remaining).max(0.0);
                previous = upper;
                slice
            }
            None => remaining,
        };
        tax += slice * bracket.rate;
        remaining -= slice;
    }
    tax
}
