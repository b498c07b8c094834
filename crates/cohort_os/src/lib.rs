#![forbid(unsafe_code)]

pub mod keyed_lock;
pub mod ph1alloc;
pub mod ph1attest;
pub mod ph1ledger;

#[cfg(test)]
mod testkit;
