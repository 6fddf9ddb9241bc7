pub mod admin;
mod health;
pub mod socket;

pub use health::{health_check, readiness_check};
pub use socket::ws_handler;
