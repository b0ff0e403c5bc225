pub mod auth;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod lakehouse;
pub mod links;
pub mod notify;
pub mod powerbi;
pub mod sharepoint;
pub mod telemetry;
pub mod workflow;

#[cfg(test)]
mod test_support;
