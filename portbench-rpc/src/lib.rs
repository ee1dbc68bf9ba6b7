//! The wire contract between the portbench testbench tools and a
//! measurement server: request/response messages (one JSON document per
//! line), the mutual-TLS configuration both sides use, and a blocking
//! client.

pub mod client;
pub mod proto;
pub mod tls;

pub use client::{ClientError, RemoteClient};
pub use proto::{Request, Response, RunOptions};
pub use tls::SslInfo;
