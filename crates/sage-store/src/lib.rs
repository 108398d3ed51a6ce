//! # sage-store
//!
//! `SQLite` persistence.
//!
//! - **sessions**: Session snapshots (the persistence boundary); implements
//!   [`sage_core::SessionPersister`]
//! - **leases**: Expiring lock leases shared by every process that opens the
//!   same database file

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod leases;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use leases::LeaseRepo;
pub use sessions::{SessionRepo, SessionSummary, SqlitePersister};
