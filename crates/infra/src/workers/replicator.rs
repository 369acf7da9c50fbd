use std::convert::Infallible;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, mpsc};
use std::thread;

use tracing::{error, info};

use streamer_core::WorkerId;

use crate::pipeline::PipelineError;

/// A worker that stopped, and why.
#[derive(Debug)]
pub struct WorkerExit {
    pub worker: WorkerId,
    pub error: PipelineError,
}

/// Handle to the running workers.
#[derive(Debug)]
pub struct ReplicatorHandle {
    exits: mpsc::Receiver<WorkerExit>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl ReplicatorHandle {
    /// Block until some worker stops. `None` once every worker has reported.
    pub fn wait_for_exit(&self) -> Option<WorkerExit> {
        self.exits.recv().ok()
    }

    /// Wait for every worker thread to finish.
    pub fn join(self) -> Vec<WorkerExit> {
        for join in self.joins {
            let _ = join.join();
        }
        self.exits.try_iter().collect()
    }
}

/// Runs N independent pipeline instances.
///
/// - One OS thread per worker, named `streamer-worker-<n>`
/// - Each thread drives its own single-threaded runtime
/// - Nothing is shared between workers except the factory itself
#[derive(Debug)]
pub struct WorkerReplicator;

impl WorkerReplicator {
    /// Spawn `count` workers; `factory` builds each worker's pipeline future
    /// on that worker's own thread.
    pub fn spawn<F, Fut>(count: usize, factory: F) -> Result<ReplicatorHandle, PipelineError>
    where
        F: Fn(WorkerId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Infallible, PipelineError>> + 'static,
    {
        let factory = Arc::new(factory);
        let (exit_tx, exit_rx) = mpsc::channel();
        let mut joins = Vec::with_capacity(count);

        for index in 0..count {
            let worker = WorkerId::new(index);
            let factory = factory.clone();
            let exit_tx = exit_tx.clone();

            let join = thread::Builder::new()
                .name(format!("streamer-{worker}"))
                .spawn(move || {
                    let error = run_worker(worker, factory.as_ref());
                    error!(%worker, error = %error, "worker exited");
                    let _ = exit_tx.send(WorkerExit { worker, error });
                })
                .map_err(|e| PipelineError::WorkerSpawn {
                    worker,
                    reason: e.to_string(),
                })?;

            joins.push(join);
        }

        info!(workers = count, "workers started");

        Ok(ReplicatorHandle {
            exits: exit_rx,
            joins,
        })
    }
}

fn run_worker<F, Fut>(worker: WorkerId, factory: &F) -> PipelineError
where
    F: Fn(WorkerId) -> Fut,
    Fut: Future<Output = Result<Infallible, PipelineError>>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            return PipelineError::WorkerSpawn {
                worker,
                reason: format!("failed to build runtime: {e}"),
            };
        }
    };

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(factory(worker))));

    match outcome {
        Ok(Ok(never)) => match never {},
        Ok(Err(error)) => error,
        Err(_) => PipelineError::WorkerPanicked { worker },
    }
}
