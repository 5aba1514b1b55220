pub mod host_messenger;
pub mod membership;
pub mod messenger_config;
pub mod messenger_events;
pub mod rejoin;
pub mod site_registry;

#[cfg(test)]
mod tests;
