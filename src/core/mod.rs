pub mod chat;
pub mod chat_stream;
pub mod config;
pub mod controller;
pub mod history;
pub mod http_backend;
pub mod message;
pub mod regenerate;
pub mod session_store;
pub mod transport;
