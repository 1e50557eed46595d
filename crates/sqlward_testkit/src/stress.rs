//! Stress tests for SQLWard.
//!
//! These harnesses hammer one `Database` from several threads and verify
//! the pool never hands the same handle to two threads at once.

use crate::fixtures::populate;
use parking_lot::Mutex;
use sqlward_core::{Database, HandleId};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Times a handle was observed leased to two threads at once.
    pub shared_leases: usize,
    /// Distinct handles observed.
    pub distinct_handles: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    fn new(
        successful: usize,
        failed: usize,
        shared_leases: usize,
        distinct_handles: usize,
        duration: Duration,
    ) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            shared_leases,
            distinct_handles,
            duration,
            ops_per_second,
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Shared leases: {}", self.shared_leases);
        println!("Distinct handles: {}", self.distinct_handles);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Operations per thread.
    pub operations: usize,
    /// Number of concurrent threads.
    pub threads: usize,
    /// Rows seeded before the run.
    pub seed_rows: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 8,
            seed_rows: 100,
        }
    }
}

/// Leases handles from `config.threads` threads concurrently, reading and
/// writing through each lease while tracking which handles are in use.
pub fn stress_concurrent_handles(db: &Database, config: &StressConfig) -> StressTestResult {
    populate(db, "stress", config.seed_rows).expect("Failed to seed stress table");

    let in_use = Arc::new(Mutex::new(HashSet::<HandleId>::new()));
    let seen = Arc::new(Mutex::new(HashSet::<HandleId>::new()));
    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let shared = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(config.threads));

    let start = Instant::now();
    let workers: Vec<_> = (0..config.threads)
        .map(|t| {
            let db = db.clone();
            let in_use = Arc::clone(&in_use);
            let seen = Arc::clone(&seen);
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let shared = Arc::clone(&shared);
            let barrier = Arc::clone(&barrier);
            let operations = config.operations;

            thread::spawn(move || {
                barrier.wait();
                for i in 0..operations {
                    let lease = match db.get_handle() {
                        Ok(lease) => lease,
                        Err(_) => {
                            failed.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                    };
                    let id = lease.id();
                    if !in_use.lock().insert(id) {
                        shared.fetch_add(1, Ordering::Relaxed);
                    }
                    seen.lock().insert(id);

                    let result = lease.with(|handle| {
                        if i % 4 == 0 {
                            handle.connection().execute(
                                "INSERT INTO stress(payload) VALUES (?1)",
                                [format!("t{t}-{i}")],
                            )?;
                        } else {
                            let _: i64 = handle.connection().query_row(
                                "SELECT count(*) FROM stress",
                                [],
                                |row| row.get(0),
                            )?;
                        }
                        Ok(())
                    });

                    in_use.lock().remove(&id);
                    drop(lease);
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("Stress worker panicked");
    }

    let distinct = seen.lock().len();
    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        shared.load(Ordering::Relaxed),
        distinct,
        start.elapsed(),
    )
}

/// Runs transactions from several threads, each inserting one row.
///
/// Returns the number of committed transactions.
pub fn stress_concurrent_transactions(db: &Database, config: &StressConfig) -> StressTestResult {
    populate(db, "stress", 0).expect("Failed to create stress table");

    let successful = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();

    let workers: Vec<_> = (0..config.threads)
        .map(|t| {
            let db = db.clone();
            let successful = Arc::clone(&successful);
            let failed = Arc::clone(&failed);
            let operations = config.operations;

            thread::spawn(move || {
                for i in 0..operations {
                    let result = db.run_transaction(|db| {
                        db.execute(format!(
                            "INSERT INTO stress(payload) VALUES ('t{t}-{i}')"
                        ))?;
                        Ok(true)
                    });
                    match result {
                        Ok(()) => successful.fetch_add(1, Ordering::Relaxed),
                        Err(_) => failed.fetch_add(1, Ordering::Relaxed),
                    };
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("Stress worker panicked");
    }

    StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        0,
        0,
        start.elapsed(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{row_count, TestDatabase};
    use sqlward_core::Config;

    #[test]
    fn test_concurrent_handles_are_exclusive() {
        let db = TestDatabase::with_config(Config::new().max_handles(4));
        let config = StressConfig {
            operations: 50,
            threads: 8,
            seed_rows: 10,
        };
        let result = stress_concurrent_handles(&db, &config);

        assert_eq!(result.shared_leases, 0);
        assert_eq!(result.failed_ops, 0);
        assert_eq!(result.total_ops, 400);
        assert!(result.distinct_handles <= 4);
        assert!(db.alive_handles() <= 4);
    }

    #[test]
    fn test_concurrent_transactions_commit() {
        let db = TestDatabase::new();
        let config = StressConfig {
            operations: 25,
            threads: 4,
            seed_rows: 0,
        };
        let result = stress_concurrent_transactions(&db, &config);

        assert_eq!(result.failed_ops, 0);
        assert_eq!(row_count(&db, "stress").unwrap(), 100);
    }
}
