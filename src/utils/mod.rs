pub mod config;
pub mod disk;
pub mod lock;
pub mod log_buffer;
pub mod logging;
