pub mod core;
pub mod error;
pub mod fs_paths;
pub mod models;
