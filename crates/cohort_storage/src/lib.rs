#![forbid(unsafe_code)]

pub mod ph1enroll;
pub mod ph1ledger;
