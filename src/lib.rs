pub mod cli;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod ids;
pub mod services;
pub mod tenant;

#[cfg(test)]
pub mod test_support;
