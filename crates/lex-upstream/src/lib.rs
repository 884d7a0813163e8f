//! Legal-data tools and the upstream API behind them.
//!
//! [`catalog`] describes every tool lexgate exposes: its argument schema,
//! how volatile its data is, and which upstream route serves it.
//! [`client`] defines the [`client::LegalDataApi`] seam with a CourtListener
//! implementation over `reqwest`; [`mock`] is an in-memory stand-in.

pub mod catalog;
pub mod client;
pub mod mock;

pub use catalog::{ArgumentError, LegalTool, Volatility};
pub use client::{CourtListenerClient, LegalDataApi, UpstreamError};
