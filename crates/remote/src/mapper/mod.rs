//! Mappers from spawns to REAPI types

pub mod action;
pub mod command;

pub use action::{ActionBuilder, MappedAction};
pub use command::{CommandMapper, MappedCommand};
