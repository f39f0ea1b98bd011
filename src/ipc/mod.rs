//! Command protocol between the Controller and Tool Meisters
//!
//! This module provides:
//! - Message types for commands and acknowledgements
//! - Newline-delimited JSON codec
//! - TCP server for the Meister
//! - Client for the Controller

pub mod client;
pub mod codec;
pub mod messages;
pub mod server;

pub use client::{MeisterClient, MeisterClientConfig};
pub use codec::NdJsonCodec;
pub use messages::{
    Acknowledgement, CollectCursor, CollectedFiles, Command, CommandKind, ErrorCode, MeisterError, MeisterRequest,
    MeisterResponse, OutcomeKind, StatusReport, SysinfoDump, SysinfoPhase, ToolOutcome, TransferFile,
};
pub use server::{MeisterServer, MeisterServerConfig, RequestHandler};
