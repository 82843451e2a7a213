pub mod blacklist;
pub mod connection;
pub mod connection_store;
pub mod dispatcher;
pub mod handshake;
pub mod liveness;
pub mod message;
pub mod server;
pub mod signed_message;
pub mod tls;
pub mod wire;
