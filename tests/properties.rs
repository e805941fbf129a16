//! Property tests for batch partitioning and sink memory bounds.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use argus::sink::{ResultRecord, ResultWriter, SinkBuilder, SinkError};
use argus::{Target, TaskId, TaskOutcome, TaskResult, partition};
use chrono::Utc;
use proptest::prelude::*;

/// Writer that takes `delay` per batch and remembers batch sizes.
#[derive(Clone)]
struct SlowWriter {
    delay: Duration,
    batches: Arc<Mutex<Vec<usize>>>,
}

#[async_trait::async_trait]
impl ResultWriter for SlowWriter {
    async fn write_batch(&mut self, records: &[ResultRecord]) -> Result<(), SinkError> {
        tokio::time::sleep(self.delay).await;
        self.batches.lock().unwrap().push(records.len());
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn location(&self) -> String {
        "slow-memory".into()
    }
}

fn result(i: usize) -> TaskResult {
    let target = Target::new(format!("host-{i}"));
    TaskResult {
        task_id: TaskId::new(1, &target, "inventory"),
        target,
        collector: "inventory".into(),
        critical: false,
        batch: 1,
        attempts: 1,
        outcome: TaskOutcome::Success {
            payload: serde_json::json!({ "i": i }),
            elapsed: Duration::from_millis(1),
        },
        finished_at: Utc::now(),
    }
}

proptest! {
    #[test]
    fn prop_partition_preserves_order_and_covers_all(n in 0usize..200, size in 1usize..40) {
        let targets: Vec<_> = (0..n).map(|i| Target::new(format!("t{i}"))).collect();
        let batches = partition(&targets, size);

        prop_assert_eq!(batches.len(), n.div_ceil(size));
        for (pos, batch) in batches.iter().enumerate() {
            prop_assert_eq!(batch.index, pos as u64 + 1);
            prop_assert!(!batch.targets.is_empty());
            prop_assert!(batch.targets.len() <= size);
        }
        if let Some((last, rest)) = batches.split_last() {
            prop_assert!(rest.iter().all(|b| b.targets.len() == size));
            prop_assert_eq!(last.targets.len(), n - size * rest.len());
        }

        let flattened: Vec<_> = batches.into_iter().flat_map(|b| b.targets).collect();
        prop_assert_eq!(flattened, targets);
    }

    #[test]
    fn prop_sink_buffer_never_exceeds_cap(
        buffer_size in 1usize..16,
        channel_capacity in 1usize..8,
        pushes in 0usize..150,
        delay_ms in 1u64..20,
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap();

        let batches = Arc::new(Mutex::new(Vec::new()));
        let writer = SlowWriter {
            delay: Duration::from_millis(delay_ms),
            batches: Arc::clone(&batches),
        };

        let stats = runtime.block_on(async {
            let sink = SinkBuilder::new("unused")
                .buffer_size(buffer_size)
                .channel_capacity(channel_capacity)
                .build_with_writer(Box::new(writer));
            for i in 0..pushes {
                sink.push(&result(i)).await.unwrap();
            }
            sink.finalize().await.unwrap();
            sink.stats()
        });

        prop_assert_eq!(stats.pushed, pushes as u64);
        prop_assert_eq!(stats.written, pushes as u64);
        prop_assert!(stats.peak_buffered <= buffer_size);
        let batches = batches.lock().unwrap();
        prop_assert!(batches.iter().all(|&n| n <= buffer_size));
        prop_assert_eq!(batches.iter().sum::<usize>(), pushes);
    }
}
