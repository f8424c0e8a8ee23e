//! Margin requirements for initial and maintenance levels.
//!
//! Requirements are side-specific basis points of notional. Shorts carry a
//! requirement at least as high as longs because their loss is unbounded.
//! Initial margin is locked when exposure opens; maintenance margin is the
//! floor below which a position becomes liquidatable.

use crate::fixed::margin_requirement;
use crate::types::{Bps, Price, Quote, Side};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginParams {
    pub long_initial: Bps,
    pub short_initial: Bps,
    pub long_maintenance: Bps,
    pub short_maintenance: Bps,
}

impl Default for MarginParams {
    fn default() -> Self {
        Self {
            long_initial: Bps::new(1_000),
            short_initial: Bps::new(1_500),
            long_maintenance: Bps::new(500),
            short_maintenance: Bps::new(750),
        }
    }
}

impl MarginParams {
    /// Same requirement on both sides, e.g. fully collateralized markets.
    pub fn symmetric(initial: Bps, maintenance: Bps) -> Self {
        Self {
            long_initial: initial,
            short_initial: initial,
            long_maintenance: maintenance,
            short_maintenance: maintenance,
        }
    }

    pub fn initial_bps(&self, side: Side) -> Bps {
        match side {
            Side::Long => self.long_initial,
            Side::Short => self.short_initial,
        }
    }

    pub fn maintenance_bps(&self, side: Side) -> Bps {
        match side {
            Side::Long => self.long_maintenance,
            Side::Short => self.short_maintenance,
        }
    }

    pub fn validate(&self) -> Result<(), MarginParamsError> {
        if self.long_initial.value() == 0 || self.long_maintenance.value() == 0 {
            return Err(MarginParamsError::ZeroRequirement);
        }
        if self.short_initial < self.long_initial || self.short_maintenance < self.long_maintenance {
            return Err(MarginParamsError::ShortBelowLong);
        }
        if self.long_maintenance > self.long_initial || self.short_maintenance > self.short_initial {
            return Err(MarginParamsError::MaintenanceAboveInitial);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MarginParamsError {
    #[error("margin requirements must be non-zero")]
    ZeroRequirement,

    #[error("short requirements must be at least the long requirements")]
    ShortBelowLong,

    #[error("maintenance requirement exceeds initial requirement")]
    MaintenanceAboveInitial,
}

pub fn initial_margin(size: u128, price: Price, side: Side, params: &MarginParams) -> Quote {
    margin_requirement(size, price, params.initial_bps(side))
}

pub fn maintenance_margin(size: u128, price: Price, side: Side, params: &MarginParams) -> Quote {
    margin_requirement(size, price, params.maintenance_bps(side))
}

/// Snapshot of an account's margin usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginSummary {
    pub collateral: Quote,
    pub margin_used: Quote,
    pub margin_reserved: Quote,
    /// collateral - margin used - margin reserved
    pub available: Quote,
    pub unrealized_pnl: Quote,
    pub equity: Quote,
}
