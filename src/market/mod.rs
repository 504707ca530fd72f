//! Venue implementations of the grid's exchange traits
//!
//! The live wire client (request signing, REST transport, push reconnects)
//! is provided outside this crate by implementing
//! [`MarketData`](crate::grid::executor::MarketData) and
//! [`OrderGateway`](crate::grid::executor::OrderGateway). This module ships
//! the local paper venue used for dry runs and end-to-end tests.

mod paper;

pub use paper::{PaperExchange, PaperExchangeInput, PaperPosition};
