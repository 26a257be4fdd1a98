//! Crate containing common functions and types used in Silo

#[macro_use]
extern crate tracing;

pub mod background;
pub mod config;
pub mod data;
pub mod error;
pub mod formater;
pub mod persister;
pub mod time;
