// perps-margin: margin perpetual futures engine.
// collateral ledger, price-time order book, VWAP mark price and a
// three-tier liquidation waterfall. deterministic, no external I/O.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: MarketId, Side, Price, Quote, Bps
//   1.5  fixed.rs: integer fixed point, rounding rules
//   2.x  order.rs: orders, price-time order book
//   3.x  margin.rs: initial/maintenance requirements per side
//   4.x  position.rs: position record and netting plans
//   6.x  liquidation.rs: liquidation test, loss waterfall, insurance
//   7.x  ledger.rs: collateral ledger, fill settlement, liquidation charges
//   8.x  engine/: placement, matching, liquidation cascade, queries
//   10.x account.rs: account balances and positions
//   11.x events.rs: state transition events for audit
//   12.x market.rs: market config + runtime state
//   13.x mark_price.rs: trade ring buffer, VWAP, mark fallback chain

// core trading modules
pub mod account;
pub mod engine;
pub mod events;
pub mod fixed;
pub mod ledger;
pub mod liquidation;
pub mod margin;
pub mod mark_price;
pub mod market;
pub mod order;
pub mod position;
pub mod types;

// re exports for convenience
pub use account::*;
pub use engine::*;
pub use events::*;
pub use ledger::*;
pub use liquidation::*;
pub use margin::*;
pub use mark_price::*;
pub use market::*;
pub use order::*;
pub use position::*;
pub use types::*;
