//! envctl library
//!
//! Dependency ordered, concurrency bounded deployment of multi-process test
//! environments, with their state persisted between runs.

pub mod apps;
pub mod commands;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod health;
pub mod logs;
pub mod storage;
pub mod utils;
