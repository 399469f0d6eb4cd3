//! Async round workers.
//!
//! Each subnet gets one tokio task that owns its orchestrator and processes
//! round requests from an mpsc queue one at a time, so round N+1 always sees
//! round N's commit. Different subnets run on separate tasks with no ordering
//! between them.

use std::collections::BTreeMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{ChainError, Result};
use crate::round::{ConsensusRoundOrchestrator, RoundOutcome, RoundRequest};
use crate::types::SubnetId;

/// Pending requests per subnet before senders wait.
const QUEUE_DEPTH: usize = 16;

struct Job {
    request: RoundRequest,
    reply: oneshot::Sender<Result<RoundOutcome>>,
}

// ---------------------------------------------------------------------------
// SubnetWorker
// ---------------------------------------------------------------------------

/// Cloneable handle for submitting rounds to one subnet's worker.
#[derive(Clone, Debug)]
pub struct SubnetHandle {
    subnet_id: SubnetId,
    sender: mpsc::Sender<Job>,
}

impl SubnetHandle {
    pub fn subnet_id(&self) -> SubnetId {
        self.subnet_id
    }

    /// Queue a round and wait for its committed outcome.
    pub async fn submit_round(&self, request: RoundRequest) -> Result<RoundOutcome> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(Job { request, reply })
            .await
            .map_err(|_| ChainError::WorkerStopped(self.subnet_id.to_string()))?;
        response
            .await
            .map_err(|_| ChainError::WorkerStopped(self.subnet_id.to_string()))?
    }
}

pub struct SubnetWorker;

impl SubnetWorker {
    /// Spawn the worker task. It stops once every handle has been dropped.
    pub fn spawn(
        mut orchestrator: ConsensusRoundOrchestrator,
        retry: RetryConfig,
    ) -> (SubnetHandle, JoinHandle<()>) {
        let subnet_id = orchestrator.subnet_id();
        let (sender, mut receiver) = mpsc::channel::<Job>(QUEUE_DEPTH);

        let task = tokio::spawn(async move {
            debug!(subnet = %subnet_id, "round worker started");
            while let Some(job) = receiver.recv().await {
                let result = run_with_retry(&mut orchestrator, job.request, &retry).await;
                // The caller may have given up waiting.
                let _ = job.reply.send(result);
            }
            debug!(subnet = %subnet_id, "round worker stopped");
        });

        (SubnetHandle { subnet_id, sender }, task)
    }
}

/// Run one round, restarting from validation after retryable failures.
async fn run_with_retry(
    orchestrator: &mut ConsensusRoundOrchestrator,
    request: RoundRequest,
    retry: &RetryConfig,
) -> Result<RoundOutcome> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match orchestrator.process_round(request.clone()) {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    subnet = %orchestrator.subnet_id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying consensus round"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// RoundScheduler
// ---------------------------------------------------------------------------

/// Owns one worker per subnet and fans epoch requests out to them.
#[derive(Debug)]
pub struct RoundScheduler {
    retry: RetryConfig,
    handles: BTreeMap<SubnetId, SubnetHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl RoundScheduler {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            handles: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    pub fn add_subnet(&mut self, orchestrator: ConsensusRoundOrchestrator) -> Result<SubnetHandle> {
        let subnet_id = orchestrator.subnet_id();
        if self.handles.contains_key(&subnet_id) {
            return Err(ChainError::Config(format!("{subnet_id} already has a worker")));
        }
        let (handle, task) = SubnetWorker::spawn(orchestrator, self.retry.clone());
        self.handles.insert(subnet_id, handle.clone());
        self.tasks.push(task);
        info!(subnet = %subnet_id, "subnet worker registered");
        Ok(handle)
    }

    pub fn subnets(&self) -> impl Iterator<Item = SubnetId> + '_ {
        self.handles.keys().copied()
    }

    pub fn handle(&self, subnet_id: SubnetId) -> Option<&SubnetHandle> {
        self.handles.get(&subnet_id)
    }

    pub async fn submit(&self, request: RoundRequest) -> Result<RoundOutcome> {
        let handle = self
            .handles
            .get(&request.subnet_id)
            .ok_or(ChainError::UnknownSubnet(request.subnet_id.0))?;
        handle.submit_round(request).await
    }

    /// Run one round per request concurrently across subnets. Results come
    /// back in request order.
    pub async fn run_epoch(&self, requests: Vec<RoundRequest>) -> Vec<(SubnetId, Result<RoundOutcome>)> {
        let mut pending = Vec::with_capacity(requests.len());
        for request in requests {
            let subnet_id = request.subnet_id;
            let Some(handle) = self.handles.get(&subnet_id).cloned() else {
                pending.push((subnet_id, None));
                continue;
            };
            let task = tokio::spawn(async move { handle.submit_round(request).await });
            pending.push((subnet_id, Some(task)));
        }

        let mut results = Vec::with_capacity(pending.len());
        for (subnet_id, task) in pending {
            let result = match task {
                None => Err(ChainError::UnknownSubnet(subnet_id.0)),
                Some(task) => task
                    .await
                    .unwrap_or_else(|err| Err(ChainError::WorkerStopped(err.to_string()))),
            };
            results.push((subnet_id, result));
        }
        results
    }

    /// Close every queue and wait for in-flight rounds to finish.
    pub async fn shutdown(self) {
        drop(self.handles);
        for task in self.tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "round worker panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
