//! Built-in Check Implementations
//!
//! Table-driven checks over the normalized resource attributes the
//! provider clients produce. Each check declares the controls it
//! satisfies; the catalog owns severity and framework tags.

pub mod aws;
pub mod azure;
