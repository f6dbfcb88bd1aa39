//! Posture Engine
//!
//! Multi-cloud compliance and security posture scanner. Scans an AWS
//! account or Azure subscription against a built-in control catalog,
//! maps findings onto compliance frameworks, and exposes the results
//! over HTTP.

pub mod api;
pub mod checks;
pub mod config;
pub mod providers;
pub mod scan;
