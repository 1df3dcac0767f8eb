pub mod http;
pub mod rest;
pub mod ws;

pub use http::serve_http;
pub use ws::{serve_ws, serve_ws_on};
