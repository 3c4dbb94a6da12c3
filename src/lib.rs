//! gridbot - event-driven perpetual futures grid trading.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── bus/          # Pub/sub core with glob patterns + capped journal
//! ├── account/      # Account registry (identity, enable/disable)
//! ├── data/         # REST + market/user WebSocket per account
//! ├── indicator/    # Indicator instances + per-symbol aggregation
//! ├── strategy/     # Signal synthesis and trade intents
//! ├── trade/        # Per-symbol task actors, grids, capital, P&L
//! ├── store/        # sqlite persistence (journal, tasks, orders)
//! └── app/          # Composition root
//! ```
//!
//! Components never call each other directly; everything flows through
//! the [`bus::EventBus`], constructed once at startup and injected.

pub mod account;
pub mod app;
pub mod bus;
pub mod config;
pub mod data;
pub mod db;
pub mod domain;
pub mod error;
pub mod indicator;
pub mod store;
pub mod strategy;
pub mod trade;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
