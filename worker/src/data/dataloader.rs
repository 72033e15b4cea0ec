use log::debug;
use machine_learning::dataset::SparseSamples;
use tokio::sync::mpsc;

/// Feeds the batches of a shard to the step driver through a bounded queue.
///
/// A background task slices the shard and blocks once `capacity` batches are waiting, so the
/// driver only ever runs on a batch that is fully loaded.
#[derive(Debug)]
pub struct DataLoader {
    rx: mpsc::Receiver<SparseSamples>,
}

impl DataLoader {
    /// Spawns the loading task.
    ///
    /// # Arguments
    /// * `samples` - The whole shard, in iteration order.
    /// * `batch_size` - The amount of samples per batch.
    /// * `capacity` - How many batches may be loaded ahead of the driver.
    pub fn spawn(samples: SparseSamples, batch_size: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        tokio::spawn(async move {
            for i in 0..samples.batch_count(batch_size) {
                let batch = match samples.batch(i, batch_size) {
                    Ok(batch) => batch.to_owned(),
                    Err(e) => {
                        debug!(batch = i, error:% = e; "stopped loading");
                        break;
                    }
                };

                if tx.send(batch).await.is_err() {
                    debug!(batch = i; "consumer is gone, stopped loading");
                    break;
                }
            }
        });

        Self { rx }
    }

    /// Waits for the next batch, `None` once the shard is exhausted.
    pub async fn next_batch(&mut self) -> Option<SparseSamples> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ndarray::{Array2, Array3};

    use super::*;

    fn samples(len: usize) -> SparseSamples {
        let keys = Array3::from_shape_fn((len, 1, 1), |(i, _, _)| i as i64);
        let labels = Array2::zeros((len, 1));
        SparseSamples::new(keys, labels).unwrap()
    }

    #[tokio::test]
    async fn batches_arrive_in_order_then_end() {
        let mut loader = DataLoader::spawn(samples(7), 3, 1);

        let first = loader.next_batch().await.unwrap();
        let second = loader.next_batch().await.unwrap();
        assert_eq!(first.keys().iter().copied().collect::<Vec<_>>(), [0, 1, 2]);
        assert_eq!(second.keys().iter().copied().collect::<Vec<_>>(), [3, 4, 5]);

        // The trailing sample doesn't fill a batch.
        assert!(loader.next_batch().await.is_none());
    }

    #[tokio::test]
    async fn loading_is_bounded_by_capacity() {
        let mut loader = DataLoader::spawn(samples(10), 1, 2);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Two batches queued, the producer waits for room.
        assert_eq!(loader.rx.len(), 2);
        loader.next_batch().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(loader.rx.len(), 2);
    }
}
