//! Protocol Engine
//!
//! The pure SWIM state machine: failure detection by randomized probing,
//! membership bookkeeping under the incarnation/suspicion discipline, and
//! infection-style dissemination of membership news and memos.
//!
//! ## Core Mechanisms
//! - **Protocol periods**: each `tick` advances suspicion counters, settles
//!   the previous period's probe, and selects the next ping target from a
//!   round-robin-random order.
//! - **Indirect probing**: when a ping goes unanswered within the ping
//!   timeout, a handful of other members are asked to probe the target on
//!   our behalf.
//! - **Incarnation numbers**: a per-node logical clock advanced only by its
//!   owner to refute suspicion; higher incarnations take precedence.
//! - **Piggybacked dissemination**: membership news and memos ride outgoing
//!   probe traffic, each item a logarithmic-in-n number of times.
//!
//! The engine performs no I/O and holds no timers; the driver in
//! [`crate::node`] feeds it timer ticks and decoded packets and transmits
//! whatever it returns. All randomness is drawn from an injected generator.

pub mod engine;
pub mod members;
pub mod types;
