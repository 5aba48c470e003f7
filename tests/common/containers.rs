// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up a broker for the Redis-backed channel tests.

use store_replication::channel::RedisChannel;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// Broker with a replication channel bound to it.
pub struct TestBroker<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestBroker<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let url = redis_url(&container);
        Self { container, url }
    }

    /// Connect a channel in the default test consumer group.
    pub async fn channel(&self, name: &str) -> RedisChannel {
        self.channel_as(name, "consumer-1").await
    }

    /// Connect a channel in the default group under another consumer name.
    pub async fn channel_as(&self, name: &str, consumer: &str) -> RedisChannel {
        RedisChannel::connect(&self.url, name, "replication", consumer)
            .await
            .expect("Failed to connect to broker")
    }

    /// Raw connection for inspecting or corrupting streams.
    pub async fn raw_connection(&self) -> redis::aio::MultiplexedConnection {
        let client = redis::Client::open(self.url.as_str()).expect("valid url");
        client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to broker")
    }
}
