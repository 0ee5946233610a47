use std::path::Path;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::fs;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use crate::connection::ConnectionConfig;
use crate::kafka::types::StrBytes;
use crate::pool::BufferPool;

/// Client settings read from a Java-style `client.properties` file.
#[derive(Debug)]
pub struct ClientProperties {
    /// The `bootstrap.servers` property
    pub bootstrap_servers: Vec<String>,
    /// The `client.id` property
    pub client_id: String,
    /// The `request.timeout.ms` property
    pub request_timeout: Duration,
    /// The `max.response.bytes` property
    pub max_response_bytes: usize,
    /// The `shutdown.timeout.ms` property
    pub shutdown_timeout: Duration,
}

impl ClientProperties {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path).await?;
        Self::read_from(BufReader::new(file)).await
    }

    pub async fn read_from<R>(mut reader: R) -> Result<Self>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut line = String::new();
        let mut props = ClientPropertiesBuilder::default();

        loop {
            line.clear();

            let n = reader
                .read_line(&mut line)
                .await
                .context("reading client.properties line")?;

            if n == 0 {
                break props.build();
            }

            let line = line.trim();

            // skip comments and blank lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            let value = value.trim();

            match key.trim() {
                "bootstrap.servers" => {
                    props.bootstrap_servers = Some(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from)
                            .collect(),
                    );
                }

                "client.id" => props.client_id = Some(value.to_string()),

                "request.timeout.ms" => {
                    let ms = value.parse().context("request.timeout.ms")?;
                    props.request_timeout = Some(Duration::from_millis(ms));
                }

                "max.response.bytes" => {
                    props.max_response_bytes = Some(value.parse().context("max.response.bytes")?);
                }

                "shutdown.timeout.ms" => {
                    let ms = value.parse().context("shutdown.timeout.ms")?;
                    props.shutdown_timeout = Some(Duration::from_millis(ms));
                }

                _ => continue,
            }
        }
    }

    /// The broker to connect to (first of `bootstrap.servers`).
    #[inline]
    pub fn bootstrap_server(&self) -> Option<&str> {
        self.bootstrap_servers.first().map(String::as_str)
    }

    pub fn connection_config(&self, pool: BufferPool) -> ConnectionConfig {
        ConnectionConfig {
            client_id: Some(StrBytes::from(self.client_id.clone())),
            request_timeout: self.request_timeout,
            max_frame_size: self.max_response_bytes,
            shutdown_timeout: self.shutdown_timeout,
            pool,
        }
    }
}

#[derive(Default)]
struct ClientPropertiesBuilder {
    bootstrap_servers: Option<Vec<String>>,
    client_id: Option<String>,
    request_timeout: Option<Duration>,
    max_response_bytes: Option<usize>,
    shutdown_timeout: Option<Duration>,
}

impl ClientPropertiesBuilder {
    fn build(self) -> Result<ClientProperties> {
        let defaults = ConnectionConfig::default();

        let bootstrap_servers = self
            .bootstrap_servers
            .filter(|servers| !servers.is_empty())
            .context("missing bootstrap.servers")?;

        Ok(ClientProperties {
            bootstrap_servers,
            client_id: self
                .client_id
                .unwrap_or_else(|| ConnectionConfig::DEFAULT_CLIENT_ID.to_string()),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            max_response_bytes: self.max_response_bytes.unwrap_or(defaults.max_frame_size),
            shutdown_timeout: self.shutdown_timeout.unwrap_or(defaults.shutdown_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parse_full() {
        let input = b"\
# client settings
bootstrap.servers=broker-1:9092, broker-2:9092
client.id = tester
request.timeout.ms=1500
max.response.bytes=1024

shutdown.timeout.ms=250
unknown.key=ignored
";

        let props = ClientProperties::read_from(&input[..])
            .await
            .expect("valid properties");

        assert_eq!(props.bootstrap_servers, ["broker-1:9092", "broker-2:9092"]);
        assert_eq!(props.bootstrap_server(), Some("broker-1:9092"));
        assert_eq!(props.client_id, "tester");
        assert_eq!(props.request_timeout, Duration::from_millis(1500));
        assert_eq!(props.max_response_bytes, 1024);
        assert_eq!(props.shutdown_timeout, Duration::from_millis(250));

        let config = props.connection_config(BufferPool::default());
        assert_eq!(config.client_id.as_ref().map(|id| id.as_str()), Some("tester"));
        assert_eq!(config.max_frame_size, 1024);
    }

    #[tokio::test]
    async fn defaults() {
        let props = ClientProperties::read_from(&b"bootstrap.servers=localhost:9092\n"[..])
            .await
            .expect("valid properties");

        assert_eq!(props.client_id, "kafka-client");
        assert_eq!(props.request_timeout, Duration::from_secs(30));
        assert_eq!(props.max_response_bytes, 100 * 1024 * 1024);
        assert_eq!(props.shutdown_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_bootstrap_servers() {
        let result = ClientProperties::read_from(&b"client.id=x\nbootstrap.servers=\n"[..]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn invalid_number() {
        let input = b"bootstrap.servers=localhost:9092\nrequest.timeout.ms=soon\n";
        let result = ClientProperties::read_from(&input[..]).await;
        assert!(result.is_err());
    }
}
