//! Redis test infrastructure
//!
//! Provides a `TestRedis` helper that starts a Redis container to back the
//! coordination store in integration tests.

use redis::aio::MultiplexedConnection;
use redis::Client;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// Test Redis wrapper that ensures proper cleanup
///
/// The container is stopped and removed when this struct is dropped.
pub struct TestRedis {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    connection: MultiplexedConnection,
    pub connection_string: String,
}

impl TestRedis {
    /// Start Redis 8 Alpine and connect to it.
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let host_port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let connection_string = format!("redis://127.0.0.1:{}", host_port);

        let client = Client::open(connection_string.clone())
            .expect("Failed to create Redis client");

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .expect("Failed to connect to Redis");

        tracing::info!(port = host_port, "Test Redis ready (Redis 8-alpine)");

        Self {
            container,
            connection,
            connection_string,
        }
    }

    /// Raw connection for inspecting keys the code under test wrote
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Stop the container while clients are connected, to exercise
    /// connection loss.
    pub async fn stop(&self) {
        if let Err(e) = self.container.stop().await {
            tracing::warn!(error = %e, "Failed to stop test Redis container");
        }
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test Redis container");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::AsyncCommands;

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_set_nx_px_is_exclusive() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        let first: Option<String> = redis::cmd("SET")
            .arg("leader")
            .arg("a")
            .arg("NX")
            .arg("PX")
            .arg(1000)
            .query_async(&mut conn)
            .await
            .unwrap();
        let second: Option<String> = redis::cmd("SET")
            .arg("leader")
            .arg("b")
            .arg("NX")
            .arg("PX")
            .arg(1000)
            .query_async(&mut conn)
            .await
            .unwrap();

        assert_eq!(first.as_deref(), Some("OK"));
        assert!(second.is_none());
        let value: String = conn.get("leader").await.unwrap();
        assert_eq!(value, "a");
    }

    #[tokio::test]
    #[ignore = "requires Docker"]
    async fn test_expiry() {
        let redis = TestRedis::new().await;
        let mut conn = redis.connection();

        conn.pset_ex::<_, _, ()>("member", "value", 200)
            .await
            .unwrap();
        let exists: bool = conn.exists("member").await.unwrap();
        assert!(exists);

        tokio::time::sleep(tokio::time::Duration::from_millis(400)).await;

        let exists: bool = conn.exists("member").await.unwrap();
        assert!(!exists);
    }
}
