pub mod codec;
pub mod frame;
pub mod mailbox;
pub mod message;
pub mod message_sender;
pub mod site_id;
pub mod subject;
