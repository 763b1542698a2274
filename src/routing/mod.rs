//! C5 — Routing Engine: rule-based forwarding between queues (spec §4.5).

mod engine;
mod predicate;

pub use engine::{RoutingEngine, RoutingRule};
pub use predicate::{Operator, Predicate};
