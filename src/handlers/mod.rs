pub mod files_handler;
pub mod health_handlers;
pub mod media_handlers;
pub mod storage_handlers;
