// Approval records and their store
pub mod models;
pub mod repository;

pub use models::{ApprovalRecord, SettlementClaim, Transition};
pub use repository::{ApprovalStore, PgApprovalStore};
