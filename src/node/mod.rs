//! Node Driver & Public API
//!
//! Owns everything the pure protocol engine does not: the UDP socket, the
//! jittered period timer and single-shot ping timer, envelope serialization,
//! and delivery of join/memo/fail events to the host application.
//!
//! ## Structure
//! - **`wire`**: the self-describing datagram envelope (sender id + packet),
//!   encoded with bincode. Malformed datagrams are silently discarded.
//! - **`service`**: the [`service::Node`] handle. Two spawned loops — a
//!   receive loop blocked on the socket and a tick loop driven by the timers —
//!   share the engine behind a mutex; engine events flow through an unbounded
//!   channel to a dispatcher task so the engine never blocks on slow
//!   handlers.

pub mod service;
pub mod wire;

#[cfg(test)]
mod tests;
