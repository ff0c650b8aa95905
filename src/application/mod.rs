//! Application layer - Use cases and business logic
//!
//! This layer contains:
//! - Services: commands, user/subscription management, the worker handler
//! - Messaging: parsing inbound chat text
//! - Errors: Domain-specific errors

pub mod errors;
pub mod services;
pub mod messaging;
