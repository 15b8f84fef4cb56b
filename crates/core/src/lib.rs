//! `stockledger-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the inventory
//! domain and its infrastructure (no storage, no IO).

pub mod actor;
pub mod aggregate;
pub mod error;
pub mod id;

pub use actor::{Actor, Capability};
pub use aggregate::{AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult, ErrorClass};
pub use id::{AggregateId, CategoryId, DivisionId, UserId};
