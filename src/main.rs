//! Anomaly Detector - Main Entry Point
//!
//! Consumes transactions from NATS JetStream, scores them in batches with
//! per-user and batch-local isolation forests, and persists anomalies.

use anomaly_stream_detector::{
    config::{AppConfig, LoggingConfig},
    consumer::{ack_all, TransactionConsumer},
    metrics::{MetricsReporter, PipelineMetrics},
    models::{loader::ModelStore, inference::ScoringRouter},
    processor::{ProcessorSettings, StreamProcessor},
    profiles::{ProfileSettings, UserProfileStore},
    store::{reconcile, Database, ResultStore},
};
use anyhow::{Context, Result};
use futures::StreamExt;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("anomaly_stream_detector={}", logging.level).parse()?)
        .add_directive(format!("anomaly_detector={}", logging.level).parse()?);
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config.logging)?;

    info!("Starting Anomaly Detector");
    info!(
        batch_size = config.pipeline.batch_size,
        workers = config.pipeline.workers,
        n_trees = config.models.n_trees,
        medium = config.detection.risk_levels.medium,
        high = config.detection.risk_levels.high,
        "Configuration loaded"
    );

    // The result store must be reachable before anything is consumed
    let db = Arc::new(Database::open(&config.database).context("Result store unavailable")?);
    reconcile(&db).context("Database schema check failed")?;

    let models = Arc::new(ModelStore::open(&config.models.models_dir)?);
    let profiles = Arc::new(UserProfileStore::new(
        Arc::clone(&db),
        models,
        ProfileSettings::from_config(&config),
    ));

    if config.models.bootstrap_on_start {
        let bootstrap = Arc::clone(&profiles);
        let min_history = config.models.min_user_transactions;
        match tokio::task::spawn_blocking(move || bootstrap.bootstrap_profiles(min_history))
            .await
            .context("Bootstrap task failed")?
        {
            Ok(report) => info!(
                users = report.users,
                models = report.models_trained,
                "Bootstrap finished"
            ),
            Err(e) => warn!(error = %e, "Bootstrap failed, continuing without it"),
        }
    }

    let metrics = Arc::new(PipelineMetrics::new());
    let mut processor = StreamProcessor::new(
        profiles,
        ResultStore::new(Arc::clone(&db)),
        ScoringRouter::from_config(&config),
        Arc::clone(&metrics),
        ProcessorSettings::from_config(&config),
    );

    let reporter = MetricsReporter::new(Arc::clone(&metrics), config.pipeline.report_interval_secs);
    tokio::spawn(reporter.start());

    let consumer = TransactionConsumer::connect(&config.nats).await?;
    let mut messages = consumer.messages().await?;
    info!(subject = consumer.subject(), "Listening for transactions");

    let mut unacked = Vec::with_capacity(config.pipeline.batch_size);
    let mut fatal = None;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break;
            }
            next = messages.next() => match next {
                Some(Ok(message)) => {
                    let outcome = processor.handle_payload(&message.payload).await;
                    unacked.push(message);

                    match outcome {
                        // Acks wait until every anomaly up to this batch is written
                        Ok(Some(report)) if report.pending > 0 => warn!(
                            pending = report.pending,
                            held = unacked.len(),
                            "Holding acknowledgements until anomalies are persisted"
                        ),
                        Ok(Some(report)) => {
                            ack_all(&mut unacked).await;
                            if report.swept {
                                info!(
                                    processed = report.total_processed,
                                    throughput = format!("{:.1} tx/s", metrics.get_throughput()),
                                    "Processing milestone"
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "Result store failed permanently");
                            fatal = Some(e);
                            break;
                        }
                    }
                }
                Some(Err(e)) => warn!(error = %e, "Failed to receive message"),
                None => {
                    warn!("Message stream closed");
                    break;
                }
            }
        }
    }

    info!("Pipeline shutting down...");
    if fatal.is_none() {
        match processor.flush().await {
            Ok(_) => {
                ack_all(&mut unacked).await;
            }
            Err(e) => {
                error!(
                    error = %e,
                    unacknowledged = unacked.len(),
                    "Final flush failed, messages will be redelivered"
                );
                fatal = Some(e);
            }
        }
    }

    metrics.print_summary();
    match processor.results().stats_summary() {
        Ok(summary) => info!(
            summary = %serde_json::to_string(&summary).unwrap_or_default(),
            "Final statistics"
        ),
        Err(e) => warn!(error = %e, "Could not read final statistics"),
    }

    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
