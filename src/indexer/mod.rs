//! Write path: version ledger, dual-index coordination and background propagation.

pub mod coordinator;
pub mod ledger;
pub mod retry;
pub mod worker;
