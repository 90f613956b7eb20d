//! Per-provider usage budgets for akm.
//!
//! Budgets are advisory request caps, not hard resource locks: the proxy
//! checks them before forwarding and records usage after a response.  See
//! [`BudgetTracker`] for the full contract.

pub mod error;
pub mod tracker;

pub use error::{BudgetError, Result};
pub use tracker::{BudgetConfig, BudgetScope, BudgetTracker, ProviderStats};
