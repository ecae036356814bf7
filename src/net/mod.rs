//! Non-blocking TCP plumbing: readiness polling and raw socket control.

pub mod poller;
pub mod socket;

pub use poller::{PollEvent, Poller};
