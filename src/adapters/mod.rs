//! Adapters
//!
//! Inbound HTTP surface and outbound store and backend implementations.

pub mod inbound;
pub mod outbound;
