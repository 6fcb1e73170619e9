//! Deployment module

pub mod backend;
pub mod deployment;
pub mod docker;
pub mod images;
pub mod lifecycle;
pub mod orchestrator;
pub mod slots;
