//! Process wiring: resolve configuration once, then run one pipeline per
//! worker until the first one fails.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{error, info};

use streamer_infra::broker::AmqpBroker;
use streamer_infra::store::MongoDocumentStore;
use streamer_infra::workers::WorkerReplicator;
use streamer_infra::{Pipeline, StreamerConfig};

/// Resolve configuration from the environment plus an optional JSON
/// overrides file given as the only argument.
pub fn load_config<I>(args: I) -> anyhow::Result<StreamerConfig>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let path = args.next().map(PathBuf::from);
    if let Some(extra) = args.next() {
        bail!("unexpected argument '{extra}' (usage: streamer-daemon [overrides.json])");
    }

    let config = match path {
        Some(path) => StreamerConfig::load_with_file(&path)
            .with_context(|| format!("loading configuration overrides from {}", path.display()))?,
        None => StreamerConfig::load(None).context("loading configuration")?,
    };
    Ok(config)
}

/// Start the workers and block until one of them stops.
///
/// Workers only stop on fatal errors, so this always returns `Err`.
pub fn run(config: StreamerConfig) -> anyhow::Result<()> {
    info!(
        workers = config.num_workers,
        queue = %config.queue_name,
        retry_queue = %config.retry_queue_name,
        database = %config.database_name,
        collection = %config.collection_name,
        "starting call streamer"
    );

    let workers = config.num_workers;
    let config = Arc::new(config);

    let handle = WorkerReplicator::spawn(workers, move |worker| {
        let config = config.clone();
        async move {
            let store = MongoDocumentStore::connect(
                &config.mongodb_url,
                &config.database_name,
                &config.collection_name,
                config.max_pool_size,
            )
            .await?;
            let broker = AmqpBroker::new(&config.rabbitmq_url);
            Pipeline::new(worker, broker, Arc::new(store), &config)
                .run()
                .await
        }
    })?;

    match handle.wait_for_exit() {
        Some(exit) => {
            error!(worker = %exit.worker, error = %exit.error, "worker stopped, shutting down");
            Err(anyhow::Error::new(exit.error).context(format!("{} stopped", exit.worker)))
        }
        None => bail!("all workers exited without reporting"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_extra_arguments() {
        let err = load_config(vec!["a.json".to_string(), "b.json".to_string()]).unwrap_err();
        assert!(err.to_string().contains("unexpected argument"));
    }

    #[test]
    fn missing_overrides_file_is_an_error() {
        let err = load_config(vec!["/nonexistent/streamer.json".to_string()]).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/streamer.json"));
    }

    #[test]
    fn overrides_file_is_applied() {
        let path = std::env::temp_dir().join(format!("streamer-daemon-{}.json", uuid::Uuid::now_v7()));
        std::fs::write(&path, r#"{"QUEUE_NAME": "streamer_queue", "NUM_WORKERS": 2}"#).unwrap();

        let config = load_config(vec![path.to_string_lossy().to_string()]);
        let _ = std::fs::remove_file(&path);

        let config = config.unwrap();
        assert_eq!(config.queue_name, "streamer_queue");
        assert_eq!(config.num_workers, 2);
    }
}
