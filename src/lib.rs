//! localchat is a streaming chat client for a locally running LLM server.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the chat session engine: the stream decoder, the session
//!   store, the streaming controller that runs one assistant turn at a time,
//!   regeneration, history loading, and configuration.
//! - [`api`] defines the request and response payloads exchanged with the
//!   server.
//! - [`cli`] parses arguments and runs the line-based chat front end.
//! - [`utils`] holds URL helpers and the transcript logger.
//!
//! The binary (`src/main.rs`) routes straight into [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
