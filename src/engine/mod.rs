// 8.0: core trading engine. coordinates collateral, order matching, mark
// prices and liquidations. deterministic, single-threaded, no external I/O.
// every public mutation journals what it touches and rolls back on error.

mod config;
mod core;
mod liquidations;
mod orders;
mod queries;
mod results;

pub use config::EngineConfig;
pub use core::Engine;
pub use results::{EngineError, ErrorKind, LiquidationResult, OrderResult};
