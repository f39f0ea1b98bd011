//! Toolmeister - synchronized benchmark tool collection
//!
//! A controller starts and stops performance tools on a set of hosts in
//! lockstep with a benchmark, through a Tool Meister agent on each host, and
//! assembles their output into one result tree per run.

pub mod assembler;
pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod id;
pub mod ipc;
pub mod meister;
pub mod registry;
pub mod storage;
pub mod supervisor;
pub mod tools;
pub mod trigger;

pub use error::{Result, ToolMeisterError};
