//! End-to-end messaging contracts.
//!
//! Each scenario in `tests/` starts two or more live [`sipchat_messenger::SessionRegistry`]
//! instances wired together through the in-process loopback transport, and asserts on
//! the events observers see and on the SIP requests that reach the wire.
