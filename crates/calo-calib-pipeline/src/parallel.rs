//! Bounded parallel execution of independent external jobs.
//!
//! Used by the software-compensation stage to run one reconstruction per
//! energy point: each job writes only its own pre-assigned output files,
//! so ordering within the batch is irrelevant. The pool size caps how
//! many reconstruction processes run at once; the call blocks until the
//! whole batch has finished.

use anyhow::{ensure, Context, Result};
use rayon::prelude::*;

/// Run all `jobs` on a pool of at most `max_parallel` workers, blocking
/// until completion. The first job error fails the batch.
pub fn run_batch<T, F>(max_parallel: usize, jobs: Vec<F>) -> Result<Vec<T>>
where
    T: Send,
    F: FnOnce() -> Result<T> + Send,
{
    ensure!(max_parallel > 0, "parallel batch needs at least one worker");
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(max_parallel)
        .build()
        .context("building the batch worker pool")?;
    pool.install(|| jobs.into_par_iter().map(|job| job()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_every_job() {
        let jobs: Vec<_> = (0..8).map(|i| move || Ok(i * i)).collect();
        let mut results = run_batch(3, jobs).unwrap();
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
    }

    #[test]
    fn concurrency_is_bounded() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let jobs: Vec<_> = (0..16)
            .map(|_| {
                let active = &active;
                let peak = &peak;
                move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .collect();
        run_batch(2, jobs).unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn first_error_fails_the_batch() {
        let jobs: Vec<Box<dyn FnOnce() -> Result<()> + Send>> = vec![
            Box::new(|| Ok(())),
            Box::new(|| anyhow::bail!("reconstruction died")),
        ];
        assert!(run_batch(2, jobs).is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let jobs: Vec<fn() -> Result<()>> = Vec::new();
        assert!(run_batch(0, jobs).is_err());
    }
}
