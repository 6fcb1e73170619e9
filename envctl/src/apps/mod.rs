//! Applications and app sets

pub mod app;
pub mod container;
pub mod manifest;
