pub mod actor;
pub mod protocol;
pub mod server;
pub mod transport;
