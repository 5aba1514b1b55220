pub mod connection;
pub mod foreign_host;
