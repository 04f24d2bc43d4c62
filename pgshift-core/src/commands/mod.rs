//! Command implementations: generate, diff, migrate, rollback, status,
//! validate, unlock.

pub mod diff;
pub mod generate;
pub mod migrate;
pub mod rollback;
pub mod status;
pub mod unlock;
pub mod validate;
