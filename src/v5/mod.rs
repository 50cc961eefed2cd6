//! The logger's "V5" binary protocol: frame codec, push server and the
//! polling client that tunnels Modbus reads through V5 frames.

pub mod client;
pub mod frame;
pub mod modbus;
pub mod payload;
pub mod server;
