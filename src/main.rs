use std::env;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kafka_client::kafka::request::{ApiVersions, Metadata};
use kafka_client::kafka::types::StrBytes;
use kafka_client::{BufferPool, ClientProperties, Connection};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = env::args().skip(1);

    let client_properties = args
        .next()
        .map(PathBuf::from)
        .context("missing required client.properties argument")?;

    let topics = args.map(StrBytes::from).collect::<Vec<_>>();

    let props = ClientProperties::load(&client_properties)
        .await
        .with_context(|| format!("parse {client_properties:?}"))?;

    info!(?props, "loaded client properties");

    let addr = props
        .bootstrap_server()
        .context("missing bootstrap server")?
        .to_string();

    let conn = Connection::connect(addr.as_str(), props.connection_config(BufferPool::default()))
        .await
        .with_context(|| format!("connect to {addr}"))?;

    let result = tokio::select! {
        result = run(&conn, topics) => result,

        sig = signal::ctrl_c() => match sig {
            Ok(()) => {
                info!("received SIGINT, shutting down");
                Ok(())
            }
            Err(e) => Err(e).context("failed while receiving an interrupt signal"),
        },
    };

    conn.close().await;

    if let Err(e) = &result {
        error!(error = %format!("{e:#}"), "client failed");
    }

    result
}

async fn run(conn: &Connection, topics: Vec<StrBytes>) -> Result<()> {
    let timeout = conn.request_timeout();

    let versions = conn
        .send(&ApiVersions::default(), timeout)
        .await
        .context("ApiVersions request")?;

    if !versions.error_code.is_ok() {
        warn!(error_code = %versions.error_code, "ApiVersions request failed");
    }

    for api in &versions.api_keys {
        info!(
            api_key = api.api_key,
            min_version = api.min_version,
            max_version = api.max_version,
            "supported API"
        );
    }

    let request = if topics.is_empty() {
        Metadata::all_topics()
    } else {
        Metadata::new(1, Some(topics))
    };

    let metadata = conn
        .send(&request, timeout)
        .await
        .context("Metadata request")?;

    for broker in &metadata.brokers {
        info!(
            node_id = broker.node_id,
            host = %broker.host,
            port = broker.port,
            controller = broker.node_id == metadata.controller_id,
            "broker"
        );
    }

    for topic in &metadata.topics {
        info!(
            topic = %topic.name,
            error_code = %topic.error_code,
            partitions = topic.partitions.len(),
            "topic"
        );
    }

    Ok(())
}
