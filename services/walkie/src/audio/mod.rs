//! Real audio devices for the session controller.

pub mod microphone;
pub mod speaker;

pub use microphone::CpalMicrophone;
pub use speaker::RodioSpeaker;
