// ============================================================================
// Domain Layer - Accounts and Orders
// ============================================================================
//
// Plain data and business rules. Nothing in here touches the database or
// the message broker; the stores and the pipeline depend on these types,
// never the other way round.
//
// ============================================================================

pub mod account;
pub mod order;

pub use account::{Account, AccountId};
