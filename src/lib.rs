// src/lib.rs
//! Multisig group coordination over independently held identity agents.
//!
//! Each [`Party`](wallet::party::Party) talks to its own agent through the
//! [`IdentityAgent`](agent::IdentityAgent) trait. The orchestrators in
//! [`services`] drive group inception, end-role authorization, rotation,
//! registry creation, issuance and the grant/admit handshake, using each
//! party's mailbox as the rendezvous barrier between members.

pub mod agent;
pub mod config;
pub mod error;
pub mod models;
pub mod services;
pub mod utils;
pub mod wallet;

pub use error::{AgentError, CoordinationError, CoordinationResult};
