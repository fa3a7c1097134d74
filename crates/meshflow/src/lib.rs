pub mod api;
pub mod config;
pub mod convert;
pub mod db;
pub mod jobs;
pub mod storage;
pub mod telemetry;
