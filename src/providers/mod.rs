pub mod fake;
pub mod provider;
