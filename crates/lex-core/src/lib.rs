//! Shared configuration for the lexgate legal-data tool server.
//!
//! Every other crate in the workspace consumes the serde-backed [`config::Config`]
//! sections defined here; runtime components convert them into their own
//! strongly-typed settings.

pub mod config;
