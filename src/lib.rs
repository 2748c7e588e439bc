pub mod api;
pub mod autosave;
pub mod calendar;
pub mod config;
pub mod edit;
pub mod logger;
pub mod models;
pub mod scheduler;
pub mod session;
