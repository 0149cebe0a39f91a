//! hailerter
//!
//! A stateful tracker over a line-delimited JSON feed of monitoring
//! messages. Each (aspect, location) pair is a flow with a current status
//! of ok, degraded or missing, plus a derived flapping state from a
//! fixed-count window of status changes. Notifications are emitted only
//! when a flow's status actually changes, subject to mute entries,
//! reminder intervals and flap suppression.
//!
//! The program reads messages on stdin, writes notification lines on
//! stdout, and answers administrative requests on a Unix control socket,
//! all from one cooperative event loop.

pub mod control;
pub mod duration;
pub mod error;
pub mod flow;
pub mod message;
pub mod queue;
pub mod tracker;

pub use error::{Error, Result};
