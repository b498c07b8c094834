#![forbid(unsafe_code)]

pub mod ph1alloc;
pub mod ph1hash;
