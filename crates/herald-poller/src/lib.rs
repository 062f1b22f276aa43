//! Herald poller library.
//!
//! Components of a single instance's poller:
//! - [`lease`]: claims requests tagged for this instance
//! - [`channel`]: execution channels (tmux, shell templates)
//! - [`delivery`]: composes and injects claimed requests
//! - [`liveness`]: registry presence and announcements
//! - [`worker`]: the poll/heartbeat loop

pub mod channel;
pub mod delivery;
pub mod lease;
pub mod liveness;
pub mod notice;
pub mod worker;
