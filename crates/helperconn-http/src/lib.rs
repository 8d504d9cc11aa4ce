//! HTTP/1.1 over helper-process connections
//!
//! Layers a request/response [`Transport`] on top of [`helperconn`], so an
//! Engine-API style client can reach a daemon through `ssh` or any other
//! registered helper.
//!
//! # Usage
//!
//! ```ignore
//! use helperconn_http::{HelperHttpTransport, HttpRequest, Transport};
//!
//! let transport = HelperHttpTransport::from_url("ssh://me@build-host");
//! let response = transport.send_http(HttpRequest::get("/_ping")).await?;
//! assert!(response.is_success());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod traits;

// Re-export commonly used types
pub use client::{DEFAULT_HOST, HelperHttpTransport};
pub use error::{Result, TransportError};
pub use traits::{HttpRequest, HttpResponse, Transport};
