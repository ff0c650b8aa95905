//! Message handling - parsing inbound chat text

pub mod parser;

pub use parser::MessageParser;
