//! C6 — Domain/Queue Manager: lifecycle and schema enforcement (spec §4.6).

pub mod manager;
pub mod schema;

pub use manager::{DomainManager, ACCOUNT_REQUESTS_QUEUE, SYSTEM_DOMAIN};
pub use schema::{FieldType, Schema, Validator};
