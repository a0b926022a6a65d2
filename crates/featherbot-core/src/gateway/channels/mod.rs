//! Channel adapters: translate a wire protocol into bus events and back.
//!
//! Each adapter is a thin `run()` loop that publishes `message:inbound`
//! events for traffic it receives and subscribes to `message:outbound`
//! to relay replies — grounded on the teacher's
//! `gateway::channels::{telegram,discord}` split, gated behind the same
//! Cargo features as the teacher so a build with neither feature still
//! links.

#[cfg(feature = "telegram")]
pub mod telegram;

#[cfg(feature = "discord")]
pub mod discord;
