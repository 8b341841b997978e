pub mod chat;
pub mod error;
pub mod misc;
pub mod responses;
