use std::{future::Future, sync::Arc};

use log::error;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{Result, SyncError};

/// Progress of a job handed to [`TransferPool::spawn`].
#[derive(Debug)]
pub enum PoolUpdate<K, R> {
    Started(K),
    Finished(K, R),
}

/// Semaphore-gated fan-out of transfer jobs.
///
/// No more than `width` jobs run at the same time. Each pool owns its own
/// gate, so downloads, uploads and manifest processing never starve each
/// other.
#[derive(Clone, Debug)]
pub struct TransferPool {
    width: usize,
    semaphore: Arc<Semaphore>,
}

impl TransferPool {
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        TransferPool {
            width,
            semaphore: Arc::new(Semaphore::new(width)),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Takes one slot of the gate for work done outside [`spawn`](Self::spawn).
    pub async fn permit(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| SyncError::Cancelled)
    }

    /// Runs `work` over `jobs` on worker tasks and streams back what happens.
    ///
    /// The receiver yields `Started` when a job gets a slot and `Finished`
    /// with its result; it closes once every spawned job is done. After `ct`
    /// fires no further job is started, jobs already running finish on their
    /// own terms.
    pub fn spawn<K, J, R, F, Fut>(
        &self,
        jobs: Vec<(K, J)>,
        ct: &CancellationToken,
        work: F,
    ) -> mpsc::UnboundedReceiver<PoolUpdate<K, R>>
    where
        K: Clone + Send + 'static,
        J: Send + 'static,
        R: Send + 'static,
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let semaphore = self.semaphore.clone();
        let ct = ct.clone();
        let work = Arc::new(work);

        tokio::spawn(async move {
            let mut workers = JoinSet::new();
            for (key, job) in jobs {
                let permit = tokio::select! {
                    biased;
                    _ = ct.cancelled() => break,
                    permit = semaphore.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };
                let tx = tx.clone();
                let work = work.clone();
                workers.spawn(async move {
                    let _permit = permit;
                    let _ = tx.send(PoolUpdate::Started(key.clone()));
                    let result = work(job).await;
                    let _ = tx.send(PoolUpdate::Finished(key, result));
                });
            }
            drop(tx);
            while let Some(joined) = workers.join_next().await {
                if let Err(err) = joined {
                    error!("Transfer worker failed: {}", err);
                }
            }
        });

        rx
    }

    /// [`spawn`](Self::spawn), collecting the finished results.
    pub async fn run<K, J, R, F, Fut>(
        &self,
        jobs: Vec<(K, J)>,
        ct: &CancellationToken,
        work: F,
    ) -> Vec<(K, R)>
    where
        K: Clone + Send + 'static,
        J: Send + 'static,
        R: Send + 'static,
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let mut updates = self.spawn(jobs, ct, work);
        let mut results = Vec::new();
        while let Some(update) = updates.recv().await {
            if let PoolUpdate::Finished(key, result) = update {
                results.push((key, result));
            }
        }
        results
    }
}
