//! Runs one processor per collection with bounded parallelism

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::ProcessorError;
use crate::processor::{Processor, ProcessorState, RunSummary};

pub struct CollectionOutcome {
    pub collection: String,
    pub result: Result<RunSummary, ProcessorError>,
}

/// Outcome of every collection in a job, in submission order.
#[derive(Default)]
pub struct JobReport {
    pub outcomes: Vec<CollectionOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobTotals {
    pub collections: usize,
    pub completed: usize,
    pub paused: usize,
    pub failed: usize,
    pub processed: u64,
    pub failed_documents: u64,
    pub skipped: u64,
}

impl JobReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| {
            matches!(&o.result, Ok(summary) if summary.state != ProcessorState::Failed)
        })
    }

    pub fn summaries(&self) -> impl Iterator<Item = &RunSummary> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn errors(&self) -> impl Iterator<Item = (&str, &ProcessorError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.collection.as_str(), e)))
    }

    pub fn totals(&self) -> JobTotals {
        let mut totals = JobTotals {
            collections: self.outcomes.len(),
            ..JobTotals::default()
        };
        for outcome in &self.outcomes {
            match &outcome.result {
                Ok(summary) => {
                    match summary.state {
                        ProcessorState::Completed => totals.completed += 1,
                        ProcessorState::Paused => totals.paused += 1,
                        _ => totals.failed += 1,
                    }
                    totals.processed += summary.processed;
                    totals.failed_documents += summary.failed_keys.len() as u64;
                    totals.skipped += summary.skipped;
                }
                Err(_) => totals.failed += 1,
            }
        }
        totals
    }
}

pub struct JobRunner {
    workers: usize,
}

impl JobRunner {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every processor to a terminal state. At most `workers` run at once;
    /// one collection failing does not stop the others.
    pub async fn run(&self, processors: Vec<Processor>) -> JobReport {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        let order: Vec<String> = processors.iter().map(|p| p.collection().to_string()).collect();

        for mut processor in processors {
            let permits = permits.clone();
            let collection = processor.collection().to_string();
            let handle = tasks.spawn(async move {
                // The semaphore is never closed.
                let _permit = permits.acquire_owned().await;
                processor.run().await
            });
            names.insert(handle.id(), collection);
        }

        info!(collections = order.len(), workers = self.workers, "Started masking job");

        let mut finished: HashMap<String, Result<RunSummary, ProcessorError>> = HashMap::new();
        while let Some(joined) = tasks.join_next_with_id().await {
            let (id, result) = match joined {
                Ok((id, result)) => (id, result),
                Err(err) => (err.id(), Err(ProcessorError::Worker(err))),
            };
            let collection = names.remove(&id).unwrap_or_default();
            if let Err(err) = &result {
                error!(collection = %collection, error = %err, "Collection failed");
            }
            finished.insert(collection, result);
        }

        let outcomes = order
            .into_iter()
            .filter_map(|collection| {
                finished
                    .remove(&collection)
                    .map(|result| CollectionOutcome { collection, result })
            })
            .collect();
        JobReport { outcomes }
    }
}
