#![forbid(unsafe_code)]

pub mod common;
pub mod ph1attest;
pub mod ph1enroll;
pub mod ph1group;
pub mod ph1hash;
pub mod ph1id;

pub use common::{ContractViolation, SchemaVersion, Validate};
