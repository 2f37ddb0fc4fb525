//! Core types, config, errors, and collaborator traits for Parley.

pub mod backend;
pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
