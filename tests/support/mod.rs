pub mod delegate;
pub mod server;
