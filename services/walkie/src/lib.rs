//! Walkie Service
//!
//! The operator shell around `walkie-core`: environment configuration, the
//! microphone and speaker, and a line-driven console.

pub mod audio;
pub mod config;
pub mod console;
