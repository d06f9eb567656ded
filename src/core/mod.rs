//! Core networking primitives shared by the accept path and the handler.

pub mod connection;

pub use connection::{ConnHandle, FrontConn, Listener, Stream};
