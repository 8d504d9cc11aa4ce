//! Example: ping a remote Docker daemon through `ssh ... docker system dial-stdio`
//!
//! # Usage
//!
//! ```bash
//! cargo run --example dial_stdio -- ssh://me@build-host
//! RUST_LOG=helperconn=debug cargo run --example dial_stdio -- ssh://me@build-host
//! ```

use std::time::Duration;

use helperconn::{ConnConfig, HelperDialer, HelperRegistry};
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let helper_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ssh://localhost".to_string());

    let dialer = HelperDialer::new(HelperRegistry::with_defaults(), ConnConfig::from_env());
    println!("Helper command: {}", dialer.resolve(&helper_url, "docker")?);

    let conn = dialer.dial(&helper_url, "docker").await?;
    conn.set_deadline(Some(Instant::now() + Duration::from_secs(30)));

    conn.write(b"GET /_ping HTTP/1.1\r\nHost: docker\r\nConnection: close\r\n\r\n")
        .await?;

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
            Err(err) => {
                eprintln!("Connection ended: {err}");
                break;
            }
        }
    }
    println!("{}", String::from_utf8_lossy(&response));

    conn.close().await?;
    Ok(())
}
