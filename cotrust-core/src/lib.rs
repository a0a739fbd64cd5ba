//! Cotrust library exports

pub mod chain;
pub mod config;
pub mod retry;
pub mod trust;
