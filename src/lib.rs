pub mod config;
pub mod error;
pub mod models;
pub mod mqtt_service;
pub mod publisher;
pub mod rest_server;
pub mod service_utils;
pub mod subscriber;
pub mod transport;
