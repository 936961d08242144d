pub mod captcha;
pub mod config;
pub mod deadline;
pub mod error;
pub mod events;
pub mod models;
pub mod notify;
pub mod portal;
pub mod registry;
pub mod routes;
pub mod runner;
pub mod task;
