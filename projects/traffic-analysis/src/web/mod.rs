// Read-only status endpoint

pub mod api;
pub mod server;
