//! Database models split into domain-specific modules.
//!
//! This module re-exports all types so callers can use `crate::db::*`.

#[macro_use]
pub mod common;

pub mod attestation;
pub mod audit;
pub mod compliance_audit;
pub mod data_export;
pub mod email_template;
pub mod feature_flag;
pub mod health_score;
pub mod organization;
pub mod pipeline;
pub mod release;
pub mod retention_policy;
pub mod rule;
pub mod security_threat;
pub mod user;
pub mod webhook;

pub use attestation::*;
pub use audit::*;
pub use common::*;
pub use compliance_audit::*;
pub use data_export::*;
pub use email_template::*;
pub use feature_flag::*;
pub use health_score::*;
pub use organization::*;
pub use pipeline::*;
pub use release::*;
pub use retention_policy::*;
pub use rule::*;
pub use security_threat::*;
pub use user::*;
pub use webhook::*;
