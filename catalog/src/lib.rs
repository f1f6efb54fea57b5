pub mod bridge;
pub mod types;
