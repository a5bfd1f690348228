pub mod config;
pub mod ffmpeg;
pub mod otel;
pub mod service;
pub mod storage;

pub const SERVICE_NAME: &str = "audio-extract-rs";
