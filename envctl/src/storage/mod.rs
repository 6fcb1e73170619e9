//! Environment state on disk

pub mod layout;
pub mod settings;
pub mod spec;
