pub mod cf;
pub mod error;
pub mod job;
pub mod json_api;
pub mod migration;
pub mod scratch;
pub mod settings;

#[cfg(test)]
pub mod mocks;
