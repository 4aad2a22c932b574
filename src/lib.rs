//! PostgreSQL (PGLite) compiled to WASI, hosted on wasmtime.
//!
//! [`Pglite::start`] unpacks the bundled cluster image, mounts it into a WASI
//! sandbox and runs the initdb handshake; [`Pglite::query`] then submits one
//! statement at a time.

pub mod archive;
pub mod config;
pub mod error;
pub mod output;
pub mod runtime;
pub mod sandbox;
pub mod server;
pub mod splitter;

pub use archive::Bundle;
pub use config::{OutputMode, Settings};
pub use error::{Error, Result};
pub use output::OutputBuffer;
pub use runtime::{CapturedOutput, Pglite};
pub use splitter::StatementSplitter;
