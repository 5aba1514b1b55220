pub mod acceptor;
pub mod fingerprint;
pub mod join_messages;
pub mod socket_joiner;
