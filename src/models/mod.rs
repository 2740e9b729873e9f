pub mod action;
pub mod photo_job;
pub mod ticket_photo;
