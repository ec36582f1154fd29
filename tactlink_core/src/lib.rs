//! TactLink Core
//!
//! The bilateral synchronization and scheduled-execution engine: clock
//! sync over a lossy radio link, macrocycle batching, and a
//! priority-scheduled motor execution core, all gated by a session
//! state machine with safety invariants — no activation after link
//! loss, after a session stop, or before synchronization is
//! established.
//!
//! # Module Structure
//!
//! - [`sync`] - Offset estimation, warm-start cache, lead-time horizon
//! - [`queue`] - Bounded, time-ordered motor event queue
//! - [`staging`] - Lock-free SPSC ring (radio callback → main context)
//! - [`motor`] - Actuator seam and the motor execution task
//! - [`therapy`] - Batch sequencer driven by a pattern source
//! - [`session`] - Session state machine with observers
//! - [`supervisor`] - Keepalive, liveness timeouts, auto-start
//! - [`metrics`] - Execution-drift and RTT statistics
//! - [`radio`] - Transport seam and loopback test pair
//! - [`engine`] - Root value wiring the components together

pub mod engine;
pub mod metrics;
pub mod motor;
pub mod queue;
pub mod radio;
pub mod session;
pub mod staging;
pub mod supervisor;
pub mod sync;
pub mod therapy;
