/*!
# Threaded execution over N-dimensional index spaces

[`threaded_map`] evaluates a function at every index of a N-dimensional array on a fixed size
[rayon] thread pool. The flattened index space is split among the workers according to a
[`Distribution`]:
 - [`Distribution::Interleaved`]: worker `w` of `T` takes the items `w, w+T, w+2T, ...`,
 - [`Distribution::Linear`]: worker `w` takes one contiguous block of items.

The results are returned in row-major order, each worker writes only to its own items.
*/

use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::ranges::{num_elements, unflatten};

/// Distribution of the items among the workers
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumIter, EnumString, Display,
)]
#[strum(ascii_case_insensitive)]
pub enum Distribution {
    #[default]
    Interleaved,
    Linear,
}
impl Distribution {
    /// Flattened indices processed by the worker `worker` of `num_workers`
    pub fn items(&self, worker: usize, num_workers: usize, num_items: usize) -> Vec<usize> {
        match self {
            Distribution::Interleaved => (worker..num_items).step_by(num_workers).collect(),
            Distribution::Linear => {
                let chunk = num_items.div_ceil(num_workers);
                let start = (worker * chunk).min(num_items);
                let end = ((worker + 1) * chunk).min(num_items);
                (start..end).collect()
            }
        }
    }
}

/// Settings of a threaded execution
#[derive(Debug, Clone)]
pub struct ThreadedExecuteParams {
    num_threads: usize,
    label: String,
    item_name: String,
    progress: bool,
    distribution: Distribution,
}
impl Default for ThreadedExecuteParams {
    fn default() -> Self {
        Self {
            num_threads: 0,
            label: "Threaded execution".into(),
            item_name: "item".into(),
            progress: false,
            distribution: Distribution::default(),
        }
    }
}
impl ThreadedExecuteParams {
    pub fn new(label: impl ToString) -> Self {
        Self {
            label: label.to_string(),
            ..Default::default()
        }
    }
    /// Requested number of workers, 0 for as many as the hardware allows
    pub fn num_threads(self, num_threads: usize) -> Self {
        Self {
            num_threads,
            ..self
        }
    }
    pub fn item_name(self, item_name: impl ToString) -> Self {
        Self {
            item_name: item_name.to_string(),
            ..self
        }
    }
    /// Shows a progress bar while executing
    pub fn progress(self, progress: bool) -> Self {
        Self { progress, ..self }
    }
    pub fn distribution(self, distribution: Distribution) -> Self {
        Self {
            distribution,
            ..self
        }
    }
    /// Number of workers for `num_items` items
    pub fn workers(&self, num_items: usize) -> usize {
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let requested = if self.num_threads == 0 {
            hardware
        } else {
            self.num_threads.min(hardware)
        };
        requested.min(num_items).max(1)
    }
}

/// Evaluates `f` at every index of an array of the given `shape`
///
/// Returns the results in row-major order.
pub fn threaded_map<const N: usize, T, F>(
    params: &ThreadedExecuteParams,
    shape: [usize; N],
    f: F,
) -> Vec<T>
where
    T: Send,
    F: Fn([usize; N]) -> T + Sync,
{
    let num_items = num_elements(&shape);
    if num_items == 0 {
        return Vec::new();
    }
    let workers = params.workers(num_items);
    let now = Instant::now();
    log::debug!(
        "{}: {} {}(s) on {} thread(s) ({})",
        params.label,
        num_items,
        params.item_name,
        workers,
        params.distribution
    );

    let pb = if params.progress {
        let pb = ProgressBar::new(num_items as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({eta})")
        {
            pb.set_style(style);
        }
        pb.set_message(params.label.clone());
        pb
    } else {
        ProgressBar::hidden()
    };

    let run_worker = |worker: usize| -> Vec<(usize, T)> {
        params
            .distribution
            .items(worker, workers, num_items)
            .into_iter()
            .map(|i| {
                let value = f(unflatten(&shape, i));
                pb.inc(1);
                (i, value)
            })
            .collect()
    };

    let mut items: Vec<(usize, T)> = match rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .build()
    {
        Ok(pool) => pool.install(|| {
            (0..workers)
                .into_par_iter()
                .flat_map_iter(run_worker)
                .collect()
        }),
        Err(e) => {
            log::warn!("{}: thread pool unavailable ({e}), running serially", params.label);
            (0..workers).flat_map(run_worker).collect()
        }
    };
    pb.finish_and_clear();
    items.sort_unstable_by_key(|(i, _)| *i);

    log::debug!(
        "{} completed in {}ms",
        params.label,
        now.elapsed().as_millis()
    );
    items.into_iter().map(|(_, value)| value).collect()
}

/// Executes `f` at every index of an array of the given `shape`
pub fn threaded_execute_indices<const N: usize, F>(
    params: &ThreadedExecuteParams,
    shape: [usize; N],
    f: F,
) where
    F: Fn([usize; N]) + Sync,
{
    threaded_map(params, shape, f);
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn distributions_cover_all_items() {
        for distribution in [Distribution::Interleaved, Distribution::Linear] {
            for workers in 1..6 {
                let mut all: Vec<usize> = (0..workers)
                    .flat_map(|w| distribution.items(w, workers, 17))
                    .collect();
                all.sort();
                assert_eq!(all, (0..17).collect::<Vec<_>>());
            }
        }
    }

    #[test]
    fn interleaved_is_round_robin() {
        assert_eq!(Distribution::Interleaved.items(1, 3, 8), vec![1, 4, 7]);
        assert_eq!(Distribution::Linear.items(1, 3, 8), vec![3, 4, 5]);
    }

    #[test]
    fn map_is_row_major() {
        for distribution in [Distribution::Interleaved, Distribution::Linear] {
            let params = ThreadedExecuteParams::new("test")
                .num_threads(4)
                .distribution(distribution);
            let values = threaded_map(&params, [3, 4, 2], |[i, j, k]| i * 100 + j * 10 + k);
            assert_eq!(values.len(), 24);
            assert_eq!(values[0], 0);
            assert_eq!(values[1], 1);
            assert_eq!(values[2], 10);
            assert_eq!(values[23], 231);
        }
    }

    #[test]
    fn execute_visits_every_index_once() {
        let count = AtomicUsize::new(0);
        let sum = AtomicUsize::new(0);
        threaded_execute_indices(
            &ThreadedExecuteParams::new("test").num_threads(3),
            [10],
            |[i]| {
                count.fetch_add(1, Ordering::Relaxed);
                sum.fetch_add(i, Ordering::Relaxed);
            },
        );
        assert_eq!(count.into_inner(), 10);
        assert_eq!(sum.into_inner(), 45);
    }

    #[test]
    fn empty_shape() {
        let values: Vec<usize> =
            threaded_map(&ThreadedExecuteParams::default(), [0, 3], |[i, _]| i);
        assert!(values.is_empty());
    }
}
