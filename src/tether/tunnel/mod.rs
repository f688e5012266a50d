//! Reverse TCP tunnel between the public relay and the origin next to the
//! game server.
//!
//! The origin holds one control connection to the relay. For every public
//! player the relay asks for a tunnel with `CREATE_TUNNEL:<id>`, the origin
//! dials back with `TUNNEL_FOR:<id>`, and the two sockets are spliced.

pub mod control;
pub mod origin;
pub mod pipe;
pub mod registry;
pub mod relay;
pub mod wire;
