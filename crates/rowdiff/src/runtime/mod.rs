//! Query dispatch runtime: a bounded worker pool per database.
//!
//! Every query against a database passes through its pool of `threads`
//! workers, each owning one driver connection. Jobs are picked up in FIFO
//! order from a shared queue; row streams flow through bounded channels so
//! a slow consumer applies backpressure all the way into the driver.
//!
//! Cancellation is cooperative: each job carries the diff's cancellation
//! token. Workers skip jobs whose token fired before they started, and
//! drivers observe the token between streamed rows. A query already on the
//! wire that the driver cannot abort runs to completion and its result is
//! discarded.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::traits::Connection;
use crate::core::value::{DbValue, Row};
use crate::drivers::DriverConnection;
use crate::error::{DiffError, Result};

/// Buffered rows per in-flight stream before backpressure kicks in.
const STREAM_BUFFER: usize = 1024;

enum Job {
    Fetch {
        sql: String,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<Vec<Vec<DbValue>>>>,
    },
    Stream {
        sql: String,
        cancel: CancellationToken,
        out: mpsc::Sender<Result<Row>>,
    },
    Execute {
        sql: String,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<u64>>,
    },
}

/// A lazy stream of downloaded rows.
///
/// Dropping the stream drops its channel; the producing worker notices on
/// the next send and stops.
pub struct RowStream {
    rx: mpsc::Receiver<Result<Row>>,
}

impl RowStream {
    /// Pull the next row. `None` means the stream is exhausted.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        self.rx.recv().await
    }

    /// Collect the remaining rows.
    pub async fn collect(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        Ok(rows)
    }
}

/// Bounded worker pool executing SQL against one database.
pub struct QueryRuntime {
    tx: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueryRuntime {
    /// Spawn one worker per connection.
    pub fn start(connections: Vec<DriverConnection>) -> Self {
        let capacity = connections.len().max(1) * 2;
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let workers = connections
            .into_iter()
            .enumerate()
            .map(|(id, conn)| tokio::spawn(worker_loop(id, conn, Arc::clone(&rx))))
            .collect();

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>> {
        self.tx
            .lock()
            .expect("runtime sender lock poisoned")
            .clone()
            .ok_or(DiffError::Cancelled)
    }

    /// Run a query and buffer its full result.
    pub async fn fetch_all(
        &self,
        sql: String,
        cancel: CancellationToken,
    ) -> Result<Vec<Vec<DbValue>>> {
        let (reply, response) = oneshot::channel();
        self.sender()?
            .send(Job::Fetch { sql, cancel, reply })
            .await
            .map_err(|_| DiffError::Cancelled)?;
        response.await.map_err(|_| DiffError::Cancelled)?
    }

    /// Run a query and stream its rows.
    pub async fn stream(&self, sql: String, cancel: CancellationToken) -> Result<RowStream> {
        let (out, rx) = mpsc::channel(STREAM_BUFFER);
        self.sender()?
            .send(Job::Stream { sql, cancel, out })
            .await
            .map_err(|_| DiffError::Cancelled)?;
        Ok(RowStream { rx })
    }

    /// Execute a statement.
    pub async fn execute(&self, sql: String, cancel: CancellationToken) -> Result<u64> {
        let (reply, response) = oneshot::channel();
        self.sender()?
            .send(Job::Execute { sql, cancel, reply })
            .await
            .map_err(|_| DiffError::Cancelled)?;
        response.await.map_err(|_| DiffError::Cancelled)?
    }

    /// Stop accepting jobs, drain the queue, and wait for every worker to
    /// finish its in-flight query.
    pub async fn shutdown(&self) {
        self.tx
            .lock()
            .expect("runtime sender lock poisoned")
            .take();
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(id: usize, mut conn: DriverConnection, rx: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        // The lock is held only while waiting for the next job, which
        // keeps pickup FIFO across workers.
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };
        run_job(&mut conn, job).await;
    }
    debug!(worker = id, "query worker stopped");
}

async fn run_job(conn: &mut DriverConnection, job: Job) {
    match job {
        Job::Fetch { sql, cancel, reply } => {
            if cancel.is_cancelled() {
                let _ = reply.send(Err(DiffError::Cancelled));
                return;
            }
            let result = tokio::select! {
                res = conn.fetch_all(&sql) => res,
                _ = cancel.cancelled() => Err(DiffError::Cancelled),
            };
            let _ = reply.send(result);
        }
        Job::Stream { sql, cancel, out } => {
            if cancel.is_cancelled() {
                return;
            }
            if let Err(err) = conn.stream(&sql, &out, &cancel).await {
                if !err.is_cancelled() {
                    let _ = out.send(Err(err)).await;
                }
            }
        }
        Job::Execute { sql, cancel, reply } => {
            if cancel.is_cancelled() {
                let _ = reply.send(Err(DiffError::Cancelled));
                return;
            }
            let result = tokio::select! {
                res = conn.execute(&sql) => res,
                _ = cancel.cancelled() => Err(DiffError::Cancelled),
            };
            let _ = reply.send(result);
        }
    }
}
