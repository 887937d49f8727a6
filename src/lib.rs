//! Crowdsec Scoring Proxy
//!
//! A transparent HTTP scoring proxy between a firewall bouncer and the
//! `CrowdSec` LAPI: fetches the full decision set, ranks it by a multi-factor
//! priority score, truncates to a configured maximum, and audits its own
//! truncation choices against fresh local alerts.

pub mod config;
pub mod handler;
pub mod scorer;
pub mod types;
pub mod upstream;
