pub mod analytics;
pub mod bootstrap;
pub mod commands;
pub mod reconciler;
pub mod session;
pub mod settings;
pub mod webhook;

#[cfg(test)]
mod test_support;
