// ABOUTME: PostgreSQL connection helpers shared by stores and the materializer
// ABOUTME: Re-exports connect and connect_with_retry

pub mod connection;

pub use connection::{connect, connect_with_retry, init_tls_policy};
