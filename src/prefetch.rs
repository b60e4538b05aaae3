//! Background workers that decode batches ahead of the training loop.

use crate::data::{
    load_examples, BatchSource, DataConfig, DataSupplier, Example, ExampleBatcher, ManifestDatabase,
};
use crate::error::DataError;
use anyhow::Result;
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Worker pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchConfig {
    /// Index order is preserved only with a single worker. With more, batches
    /// reach the queue in completion order, so a dataset-sized window of
    /// batches is no longer guaranteed to be exactly one pass.
    pub workers: usize,
    /// Bound of the batch queue.
    pub capacity: usize,
}

/// Pool of threads feeding a bounded batch queue.
///
/// Workers only read the dataset; they never see model parameters.
pub struct Prefetcher {
    receiver: Option<Receiver<Result<Vec<Example>>>>,
    workers: Vec<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
    batcher: ExampleBatcher,
}

impl Prefetcher {
    pub fn start(
        mut supplier: DataSupplier,
        config: PrefetchConfig,
    ) -> Result<Self> {
        let (sender, receiver) = sync_channel(config.capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let database = supplier.database().clone();
        let data_config = supplier.config().clone();
        let batch_size = supplier.batch_size();
        let batcher = supplier.batcher();
        let rngs: Vec<StdRng> = (0..config.workers.max(1))
            .map(|_| supplier.fork_rng())
            .collect();
        let supplier = Arc::new(Mutex::new(supplier));

        let mut workers = Vec::with_capacity(rngs.len());
        for (id, rng) in rngs.into_iter().enumerate() {
            let worker = Worker {
                supplier: supplier.clone(),
                database: database.clone(),
                config: data_config.clone(),
                batch_size,
                rng,
                sender: sender.clone(),
                stop: stop.clone(),
            };
            let handle = std::thread::Builder::new()
                .name(format!("prefetch-{id}"))
                .spawn(move || worker.run())?;
            workers.push(handle);
        }
        debug!("started {} prefetch workers", workers.len());

        Ok(Self {
            receiver: Some(receiver),
            workers,
            stop,
            batcher,
        })
    }

    /// Stop the workers and wait up to `timeout` for them to exit.
    ///
    /// Returns the number of workers that did not finish in time; those are
    /// left detached.
    pub fn stop(&mut self, timeout: Duration) -> usize {
        self.stop.store(true, Ordering::SeqCst);
        // Closing the queue releases workers parked on a full channel.
        self.receiver.take();

        let deadline = Instant::now() + timeout;
        while self.workers.iter().any(|w| !w.is_finished()) && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }

        let mut stuck = 0;
        for handle in self.workers.drain(..) {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("prefetch worker panicked");
                }
            } else {
                stuck += 1;
            }
        }
        if stuck > 0 {
            warn!("{stuck} prefetch workers did not stop within {timeout:?}");
        }
        stuck
    }
}

impl BatchSource for Prefetcher {
    fn next_batch(&mut self) -> Result<Vec<Example>> {
        let receiver = self.receiver.as_ref().ok_or(DataError::Disconnected)?;
        receiver.recv().map_err(|_| DataError::Disconnected)?
    }

    fn batcher(&self) -> ExampleBatcher {
        self.batcher.clone()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop(Duration::from_secs(5));
        }
    }
}

struct Worker {
    supplier: Arc<Mutex<DataSupplier>>,
    database: Arc<ManifestDatabase>,
    config: DataConfig,
    batch_size: usize,
    rng: StdRng,
    sender: SyncSender<Result<Vec<Example>>>,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(mut self) {
        while !self.stop.load(Ordering::SeqCst) {
            let indices = match self.supplier.lock() {
                Ok(mut supplier) => supplier.next_indices(self.batch_size),
                Err(_) => return,
            };
            let batch = load_examples(self.database.as_ref(), &indices, &self.config, &mut self.rng);
            let failed = batch.is_err();
            if !self.push(batch) || failed {
                return;
            }
        }
    }

    /// Returns false once the pool is stopping or the queue is closed.
    fn push(&self, mut item: Result<Vec<Example>>) -> bool {
        loop {
            match self.sender.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(back)) => {
                    if self.stop.load(Ordering::SeqCst) {
                        return false;
                    }
                    item = back;
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tests::write_images;
    use std::collections::HashSet;

    fn prefetcher(count: usize, workers: usize) -> (tempfile::TempDir, Prefetcher) {
        let dir = tempfile::tempdir().unwrap();
        let database = write_images(dir.path(), count, 8);
        let config = DataConfig {
            image_size: 4,
            load_size: 4,
        };
        let supplier = DataSupplier::new(Arc::new(database), config, 1, 5).unwrap();
        let pool = Prefetcher::start(
            supplier,
            PrefetchConfig {
                workers,
                capacity: 2,
            },
        )
        .unwrap();
        (dir, pool)
    }

    #[test]
    fn single_worker_covers_a_full_pass() {
        let (_dir, mut pool) = prefetcher(6, 1);
        let seen: HashSet<_> = (0..6)
            .map(|_| pool.next_batch().unwrap()[0].path.clone())
            .collect();
        assert_eq!(seen.len(), 6);
        assert_eq!(pool.stop(Duration::from_secs(5)), 0);
    }

    #[test]
    fn many_workers_keep_serving() {
        let (_dir, mut pool) = prefetcher(3, 4);
        for _ in 0..10 {
            assert_eq!(pool.next_batch().unwrap().len(), 1);
        }
    }

    #[test]
    fn stop_releases_workers_blocked_on_full_queue() {
        let (_dir, mut pool) = prefetcher(4, 2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.stop(Duration::from_secs(5)), 0);
        assert!(pool.next_batch().is_err());
    }

    #[test]
    fn decode_errors_reach_the_consumer() {
        let database = crate::data::ManifestDatabase::new(
            1,
            vec![crate::data::ManifestEntry {
                path: "/nonexistent/missing.png".into(),
                classes: vec![],
            }],
        )
        .unwrap();
        let config = DataConfig {
            image_size: 4,
            load_size: 4,
        };
        let supplier = DataSupplier::new(Arc::new(database), config, 1, 0).unwrap();
        let mut pool = Prefetcher::start(
            supplier,
            PrefetchConfig {
                workers: 1,
                capacity: 1,
            },
        )
        .unwrap();
        assert!(pool.next_batch().is_err());
    }
}
