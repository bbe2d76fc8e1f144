// Integration tests run against the in-memory broker unless marked #[ignore].

mod common;
mod connection_test;
mod consumer_test;
mod listener_test;
mod shutdown_test;
