//! Application services - Business logic orchestration

pub mod bridge_service;
pub mod command_service;
pub mod user_manager;

pub use bridge_service::BridgeService;
pub use command_service::CommandService;
pub use user_manager::UserManager;
