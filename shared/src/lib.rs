pub mod message;
pub mod protocol;
pub mod types;
