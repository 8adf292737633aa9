pub mod bar;
pub mod config;
pub mod coordinator;
pub mod desktops;
pub mod ipc;
pub mod services;
pub mod utils;
