//! Domain layer - Core business objects and the seams around them
//!
//! This layer contains:
//! - Entities: User, inbound Message, Command, Subscription
//! - Traits: Bot (outbound send), UpdateHandler (per-unit business logic)

pub mod entities;
pub mod traits;
