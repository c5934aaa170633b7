pub mod compat;
pub mod config;
pub mod error;
pub mod hash;
pub mod storage;
pub mod types;
