pub mod api;
pub mod broker;
pub mod channels;
pub mod clients;
pub mod config;
pub mod models;
pub mod services;
