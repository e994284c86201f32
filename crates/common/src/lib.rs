//! Common types shared across the PTT media crates.

#![warn(clippy::pedantic)]

/// Module for identifier types
pub mod types;
