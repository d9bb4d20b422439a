pub mod frame;
pub mod message;
pub mod protocol;
pub mod server;
