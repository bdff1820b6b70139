//! Core types shared by every layer of the client

pub mod config;
pub mod error;
pub mod value;
