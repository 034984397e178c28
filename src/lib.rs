pub mod audio;
pub mod config;
pub mod error;
pub mod replay;
pub mod session;
pub mod turn;
