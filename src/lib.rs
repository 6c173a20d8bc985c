//! Heater Hub - heating-control hub daemon
//!
//! Answers mode requests from heater controllers on the LAN, takes SMS
//! commands from the household, and falls back to frost protection when
//! the SMS path or the network goes away.

pub mod protocol;
pub mod connections;
pub mod heater;
pub mod access;
pub mod persistence;
pub mod state;
pub mod messaging;
pub mod probes;
pub mod commands;
pub mod interpreter;
pub mod watchdog;
pub mod hub;
pub mod config;
pub mod error;

pub use error::{Error, Result};
