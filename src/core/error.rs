use std::path::PathBuf;

/// How a failure should be surfaced to whoever asked for the simulation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The request can be fixed by the caller (bad tag, unknown country, ...).
    Validation,
    /// Data or table inconsistency the caller cannot fix by editing one field.
    Internal,
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("invalid allocation: {0}")]
    InvalidAllocation(String),

    #[error("portfolio value cannot be negative (got {0})")]
    NegativePortfolio(f64),

    #[error("unknown country '{country}', available: {available}")]
    UnknownCountry { country: String, available: String },

    #[error("no overlapping years between stock, bond and inflation series for '{0}'")]
    NoOverlap(String),

    #[error("failed to read dataset {path}: {source}")]
    DatasetIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed dataset {path}: {message}")]
    DatasetFormat { path: PathBuf, message: String },

    #[error("unknown tax country '{0}'")]
    UnknownTaxCountry(String),

    #[error("unknown tax region '{region}' for country '{country}'")]
    UnknownTaxRegion { country: String, region: String },

    #[error("malformed tax tables: {0}")]
    TaxTables(String),

    #[error("invalid {name} distribution: {message}")]
    InvalidDistribution { name: &'static str, message: String },

    #[error("reverse tax solver did not converge for net {net_income} in {iterations} steps")]
    DidNotConverge { net_income: f64, iterations: u32 },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("simulation cancelled")]
    Cancelled,
}

impl SimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidAllocation(_)
            | Self::NegativePortfolio(_)
            | Self::UnknownCountry { .. }
            | Self::UnknownTaxCountry(_)
            | Self::UnknownTaxRegion { .. }
            | Self::InvalidDistribution { .. }
            | Self::InvalidConfig(_) => ErrorKind::Validation,
            Self::NoOverlap(_)
            | Self::DatasetIo { .. }
            | Self::DatasetFormat { .. }
            | Self::TaxTables(_)
            | Self::DidNotConverge { .. } => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

pub type SimResult<T> = Result<T, SimError>;
