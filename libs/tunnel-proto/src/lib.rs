//! Wire types shared between the daemon and the in-cluster endpoint.
//!
//! The data plane is a single bidirectional stream of [`Frame`]s, one frame
//! per connection event, multiplexed by [`ConnId`].
//! The control plane is a request/response + server-streaming protocol of
//! length-delimited JSON messages, see [`control`].

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod connid;
mod frame;

pub mod control;

pub use connid::{ConnId, ConnIdError, Protocol};
pub use frame::{CloseReason, Frame, FrameCodec, FrameError, SessionInfo};
