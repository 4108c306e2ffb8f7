//! The parent side of the startup handshake.
//!
//! `prepare` builds the work directory and argument bundle before the fork;
//! `perform` watches the child until it is ready or demonstrably not. The
//! state threaded between them is the [`session::HandshakeSession`].

pub(crate) mod perform;
pub(crate) mod prepare;
pub(crate) mod session;
