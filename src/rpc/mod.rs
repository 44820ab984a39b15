mod server;
mod types;

pub use server::{create_app, run_http_server, run_stdio_server, AppState};
pub use types::*;
