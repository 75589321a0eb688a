pub mod core;
pub mod repair;
pub mod settings;
