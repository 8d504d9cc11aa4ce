//! Command-backed connections
//!
//! Turns an external helper process (an `ssh` invocation, `socat`, or any
//! program that forwards bytes to a remote endpoint) into a bidirectional
//! stream a protocol client can use like a socket.
//!
//! # Architecture
//!
//! - **ProcessAttributes**: platform hook that puts each helper in its own
//!   session and knows how to ask it to terminate
//! - **ProcessSpawner**: starts helpers with piped stdin/stdout and a bounded
//!   stderr capture
//! - **CommandConn**: the stream, with independent half-close, emulated
//!   deadlines and exactly-once teardown
//! - **HelperDialer**: maps a helper URL to a command line and connects
//!
//! Encryption, authentication and framing are left to the helper and to the
//! protocol layered on top.
//!
//! # Usage
//!
//! ```ignore
//! use helperconn::HelperDialer;
//!
//! let dialer = HelperDialer::default();
//! let conn = dialer.dial("ssh://me@build-host", "docker").await?;
//! conn.write(b"GET /_ping HTTP/1.1\r\nHost: docker\r\n\r\n").await?;
//! let mut buf = [0u8; 1024];
//! let n = conn.read(&mut buf).await?;
//! conn.close().await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod attributes;
pub mod config;
pub mod conn;
pub mod dialer;
pub mod error;
pub mod exit;
pub mod registry;
pub mod spawner;
pub mod ssh;

// Re-export commonly used types
pub use attributes::{PlatformAttributes, ProcessAttributes};
pub use config::ConnConfig;
pub use conn::{CommandConn, ConnIo, ConnState, HelperAddr};
pub use dialer::HelperDialer;
pub use error::{ConnError, Result};
pub use exit::ExitState;
pub use registry::{Helper, HelperRegistry, HelperTemplate};
pub use spawner::{CommandSpec, ProcessSpawner, SpawnedProcess};
pub use ssh::SshSpec;
