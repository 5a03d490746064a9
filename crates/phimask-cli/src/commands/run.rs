use anyhow::{Result, bail};
use phimask_config::{JobConfig, MaskingMode};
use phimask_core::ConfigurationError;
use phimask_engine::{
    BatchSizeOptions, CancellationFlag, Connector, CopyConnector, InSituConnector, JobRunner,
    Processor, RetryPolicy, RunOptions,
};
use phimask_masking::{MaskingEngine, RuleSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use super::{Stores, load_config, open_stores};

pub struct RunArgs {
    pub run_id: Option<String>,
    pub collections: Vec<String>,
    pub in_situ: bool,
    pub confirm_destructive: bool,
    pub reset_checkpoint: bool,
    pub reset_destination: bool,
    pub limit: Option<u64>,
    pub dry_run: bool,
}

pub async fn handle(config_path: Option<PathBuf>, args: RunArgs) -> Result<()> {
    let config = load_config(config_path)?;
    let in_situ = args.in_situ || config.masking_mode == MaskingMode::InSitu;

    // Refuse destructive runs before touching any store.
    if in_situ && !args.confirm_destructive {
        let collection = config.phi_collections.join(", ");
        bail!(ConfigurationError::DestructiveNotConfirmed(collection));
    }
    if in_situ && args.reset_destination {
        bail!("--reset-destination only applies to separate (copy) mode");
    }

    let collections = select_collections(&config, &args.collections)?;
    let rules = Arc::new(RuleSet::load(&config.rules_path)?);
    info!(
        rules = rules.len(),
        categories = ?rules.categories(),
        fingerprint = %rules.fingerprint(),
        "Loaded masking rules"
    );
    if config.seed.is_none() {
        warn!("No seed configured; masked values will differ between runs");
    }

    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let stores = open_stores(&config).await?;
    let engine = MaskingEngine::new(rules).with_seed(config.seed);
    let cancel = CancellationFlag::new();

    let mut processors = Vec::with_capacity(collections.len());
    for collection in &collections {
        let connector = connector_for(&config, &stores, collection, in_situ, &args)?;
        let processor = Processor::new(
            connector,
            engine.clone(),
            stores.checkpoints.clone(),
            run_options(&config, &run_id, &args),
        )
        .with_cancellation(cancel.clone());
        processors.push(processor);
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, pausing after the current batch");
                cancel.cancel();
            }
        });
    }

    println!("Run id: {}", run_id);
    let report = JobRunner::new(config.workers).run(processors).await;

    for summary in report.summaries() {
        println!(
            "  {} [{:?}] processed={} failed={} skipped={} batches={}",
            summary.collection,
            summary.state,
            summary.processed,
            summary.failed_keys.len(),
            summary.skipped,
            summary.batches
        );
        if !summary.failed_keys.is_empty() {
            let keys: Vec<String> = summary.failed_keys.iter().map(|k| k.to_string()).collect();
            println!("    failed keys: {}", keys.join(", "));
        }
    }
    for (collection, err) in report.errors() {
        println!("  {} [Failed] {}", collection, err);
    }

    let totals = report.totals();
    println!(
        "✓ {} collections: {} completed, {} paused, {} failed ({} documents masked, {} failed, {} skipped)",
        totals.collections,
        totals.completed,
        totals.paused,
        totals.failed,
        totals.processed,
        totals.failed_documents,
        totals.skipped
    );
    if totals.paused > 0 {
        println!("  Resume with: phimask run --run-id {}", run_id);
    }

    if !report.is_success() {
        bail!("{} collection(s) failed", totals.failed);
    }
    Ok(())
}

fn select_collections(config: &JobConfig, requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(config.phi_collections.clone());
    }
    for collection in requested {
        if !config.phi_collections.contains(collection) {
            bail!(ConfigurationError::Invalid(format!(
                "collection '{}' is not listed in phi_collections",
                collection
            )));
        }
    }
    Ok(requested.to_vec())
}

fn connector_for(
    config: &JobConfig,
    stores: &Stores,
    collection: &str,
    in_situ: bool,
    args: &RunArgs,
) -> Result<Arc<dyn Connector>> {
    if in_situ {
        let connector = InSituConnector::new(stores.documents.clone(), collection, args.confirm_destructive)?;
        return Ok(Arc::new(connector));
    }

    let connector = CopyConnector::new(
        stores.documents.clone(),
        stores.documents.clone(),
        collection,
        config.destination_for(collection),
    )?;
    Ok(Arc::new(connector))
}

fn run_options(config: &JobConfig, run_id: &str, args: &RunArgs) -> RunOptions {
    let mut options = RunOptions::new(run_id);
    options.checkpoint_interval = config.checkpoint_interval;
    options.batch_size = BatchSizeOptions {
        initial: config.batch_size.initial,
        min: config.batch_size.min,
        max: config.batch_size.max,
        target_write_latency: config.retry.target_write_latency(),
    };
    options.retry = RetryPolicy {
        max_attempts: config.retry.max_attempts,
        backoff_base: config.retry.backoff_base(),
        backoff_max: config.retry.backoff_max(),
        op_timeout: config.retry.op_timeout(),
    };
    options.limit = args.limit;
    options.dry_run = args.dry_run;
    options.reset_checkpoint = args.reset_checkpoint;
    // Dropped by the processor after validation; also clears the checkpoint.
    options.reset_destination = args.reset_destination;
    options
}
