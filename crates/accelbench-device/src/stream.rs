use std::ops::Deref;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;

use accelbench_core::{AccelError, ExecutionStream, Result, StreamOp};

enum Command {
    Run(StreamOp),
    Fence(Sender<()>),
}

/// An execution stream backed by a dedicated worker thread.
///
/// Operations run in issue order. The first failing operation poisons the
/// stream: later operations are skipped until the error is collected by
/// [`synchronize`](ExecutionStream::synchronize).
pub struct HostStream {
    index: usize,
    commands: Option<Sender<Command>>,
    sticky_error: Arc<Mutex<Option<AccelError>>>,
    worker: Option<JoinHandle<()>>,
}

impl HostStream {
    pub fn new(index: usize) -> Result<Self> {
        let (tx, rx) = unbounded::<Command>();
        let sticky_error = Arc::new(Mutex::new(None));
        let worker_error = Arc::clone(&sticky_error);

        let worker = thread::Builder::new()
            .name(format!("accel-stream-{index}"))
            .spawn(move || {
                for command in rx {
                    match command {
                        Command::Run(op) => {
                            if worker_error.lock().is_some() {
                                continue;
                            }
                            if let Err(e) = op() {
                                tracing::debug!(stream = index, error = %e, "stream operation failed");
                                *worker_error.lock() = Some(e);
                            }
                        }
                        Command::Fence(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| AccelError::Setup(format!("stream {index} worker spawn failed: {e}")))?;

        Ok(Self {
            index,
            commands: Some(tx),
            sticky_error,
            worker: Some(worker),
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .as_ref()
            .and_then(|tx| tx.send(command).ok())
            .ok_or_else(|| AccelError::Execution(format!("stream {} worker is gone", self.index)))
    }
}

impl ExecutionStream for HostStream {
    fn index(&self) -> usize {
        self.index
    }

    fn enqueue(&self, op: StreamOp) -> Result<()> {
        self.send(Command::Run(op))
    }

    fn synchronize(&self) -> Result<()> {
        let (done_tx, done_rx) = bounded(1);
        self.send(Command::Fence(done_tx))?;
        done_rx.recv().map_err(|_| {
            AccelError::Execution(format!("stream {} worker exited before fence", self.index))
        })?;
        match self.sticky_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for HostStream {
    fn drop(&mut self) {
        // Closing the queue lets the worker finish in-flight work and exit.
        drop(self.commands.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(stream = self.index, "stream worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for HostStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostStream").field("index", &self.index).finish()
    }
}

/// A pool of execution streams for overlapping work.
pub struct StreamPool {
    all: Vec<Arc<HostStream>>,
    free: Mutex<Vec<Arc<HostStream>>>,
}

/// A stream borrowed from a [`StreamPool`]; returned to the pool on drop.
pub struct PooledStream<'a> {
    pool: &'a StreamPool,
    stream: Option<Arc<HostStream>>,
}

impl Deref for PooledStream<'_> {
    type Target = HostStream;

    fn deref(&self) -> &HostStream {
        // Only `Drop` takes the stream out.
        self.stream.as_deref().unwrap_or_else(|| unreachable!())
    }
}

impl std::fmt::Debug for PooledStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledStream")
            .field("index", &self.stream.as_ref().map(|s| s.index()))
            .finish()
    }
}

impl Drop for PooledStream<'_> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.pool.release(stream);
        }
    }
}

impl StreamPool {
    /// Create a pool of `count` streams with ordinals starting at `first_index`.
    pub fn new(count: usize, first_index: usize) -> Result<Self> {
        let mut all = Vec::with_capacity(count);
        for i in 0..count {
            all.push(Arc::new(HostStream::new(first_index + i)?));
        }
        tracing::debug!(count, "created stream pool");

        let mut free = all.clone();
        // Pop order hands out the lowest ordinal first.
        free.reverse();
        Ok(Self {
            all,
            free: Mutex::new(free),
        })
    }

    /// Borrow a stream from the pool. Returns `None` if all streams are in use.
    pub fn try_acquire(&self) -> Option<PooledStream<'_>> {
        self.free.lock().pop().map(|stream| PooledStream {
            pool: self,
            stream: Some(stream),
        })
    }

    /// Borrow two distinct streams, for double buffering.
    pub fn acquire_pair(&self) -> Result<(PooledStream<'_>, PooledStream<'_>)> {
        let unavailable = || {
            AccelError::Setup(format!(
                "double buffering needs 2 free streams, {} of {} available",
                self.available(),
                self.pool_size()
            ))
        };
        let a = self.try_acquire().ok_or_else(unavailable)?;
        let b = self.try_acquire().ok_or_else(unavailable)?;
        Ok((a, b))
    }

    fn release(&self, stream: Arc<HostStream>) {
        self.free.lock().push(stream);
    }

    /// Number of streams in this pool.
    pub fn pool_size(&self) -> usize {
        self.all.len()
    }

    /// Number of streams currently available.
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Wait for all work on every stream, borrowed or not.
    pub fn sync_all(&self) -> Result<()> {
        let mut first_error = None;
        for stream in &self.all {
            if let Err(e) = stream.synchronize() {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn operations_run_in_issue_order() {
        let stream = HostStream::new(0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..16 {
            let log = Arc::clone(&log);
            stream
                .enqueue(Box::new(move || -> Result<()> {
                    if i % 4 == 0 {
                        thread::sleep(Duration::from_micros(200));
                    }
                    log.lock().push(i);
                    Ok(())
                }))
                .unwrap();
        }
        stream.synchronize().unwrap();
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn enqueue_does_not_wait_for_completion() {
        let stream = HostStream::new(0).unwrap();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        stream
            .enqueue(Box::new(move || -> Result<()> {
                let _ = gate_rx.recv();
                Ok(())
            }))
            .unwrap();
        // The worker is parked on the gate; enqueue already returned.
        gate_tx.send(()).unwrap();
        stream.synchronize().unwrap();
    }

    #[test]
    fn errors_are_sticky_until_synchronize() {
        let stream = HostStream::new(3).unwrap();
        let ran = Arc::new(Mutex::new(false));
        stream
            .enqueue(Box::new(|| -> Result<()> {
                Err(AccelError::Execution("boom".into()))
            }))
            .unwrap();
        {
            let ran = Arc::clone(&ran);
            stream
                .enqueue(Box::new(move || -> Result<()> {
                    *ran.lock() = true;
                    Ok(())
                }))
                .unwrap();
        }
        let err = stream.synchronize().unwrap_err();
        assert!(err.is_execution_failure());
        assert!(!*ran.lock(), "operations after a failure are skipped");

        // Collected; the stream is usable again.
        stream.enqueue(Box::new(|| -> Result<()> { Ok(()) })).unwrap();
        stream.synchronize().unwrap();
    }

    #[test]
    fn pool_hands_out_distinct_streams_and_takes_them_back() {
        let pool = StreamPool::new(2, 1).unwrap();
        {
            let (a, b) = pool.acquire_pair().unwrap();
            assert_ne!(a.index(), b.index());
            assert_eq!(a.index(), 1);
            assert_eq!(pool.available(), 0);
            assert!(pool.try_acquire().is_none());
            assert!(pool.acquire_pair().unwrap_err().is_setup_failure());
        }
        assert_eq!(pool.available(), 2);
        pool.sync_all().unwrap();
    }
}
