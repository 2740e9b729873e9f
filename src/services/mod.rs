pub mod action_processor;
pub mod capture;
pub mod connectivity;
pub mod durable_queue;
pub mod geocode;
pub mod kv;
pub mod notify;
pub mod overlay;
pub mod photo_jobs;
pub mod pipeline;
pub mod ticket_api;
pub mod tracking;
pub mod worker;
