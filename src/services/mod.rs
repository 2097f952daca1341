pub mod health_service;
pub mod media_service;
