use std::sync::OnceLock;

/// Parallel thresholds for rectangle transcodes, in pixels.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SplitPolicy {
    /// Rectangles smaller than this always run on the calling thread.
    pub(crate) min_pixels: usize,
    /// No chunk is made smaller than this.
    pub(crate) min_chunk_pixels: usize,
    pub(crate) max_workers: usize,
}

impl SplitPolicy {
    /// Rows per parallel chunk for a `rows` × `row_pixels` rectangle, or
    /// `None` when the rectangle should be converted serially.
    pub(crate) fn chunk_rows(&self, rows: usize, row_pixels: usize) -> Option<usize> {
        let workers = transcode_workers(self.max_workers);
        if workers <= 1 || rows < 2 || row_pixels == 0 {
            return None;
        }
        let total = rows.saturating_mul(row_pixels);
        if total < self.min_pixels.max(self.min_chunk_pixels.saturating_mul(workers)) {
            return None;
        }

        let min_rows = self.min_chunk_pixels.div_ceil(row_pixels).max(1);
        let chunk_rows = rows.div_ceil(workers).max(min_rows);
        (chunk_rows < rows).then_some(chunk_rows)
    }
}

/// Build the transcode pool now instead of on the first large flush.
pub(crate) fn warmup_pool(max_workers: usize) {
    install_transcode_pool(max_workers, || {});
}

pub(crate) fn transcode_workers(max_workers: usize) -> usize {
    static WORKERS: OnceLock<usize> = OnceLock::new();
    let available = *WORKERS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    available.min(max_workers.max(1))
}

/// Run `job` inside the shared transcode pool, or inline when the machine
/// has a single worker or the pool could not be built.
pub(crate) fn install_transcode_pool<F>(max_workers: usize, job: F)
where
    F: FnOnce() + Send,
{
    static POOL: OnceLock<Option<rayon::ThreadPool>> = OnceLock::new();
    let pool = POOL.get_or_init(|| {
        let workers = transcode_workers(max_workers);
        if workers <= 1 {
            return None;
        }
        rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("snow-relay-transcode-{index}"))
            .build()
            .inspect_err(|err| tracing::warn!("transcode pool unavailable: {err}"))
            .ok()
    });
    match pool {
        Some(pool) => pool.install(job),
        None => job(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: SplitPolicy = SplitPolicy {
        min_pixels: 262_144,
        min_chunk_pixels: 65_536,
        max_workers: 8,
    };

    #[test]
    fn small_rectangles_stay_serial() {
        assert_eq!(POLICY.chunk_rows(10, 100), None);
        assert_eq!(POLICY.chunk_rows(1, 10_000_000), None);
        assert_eq!(POLICY.chunk_rows(1_000, 0), None);
    }

    #[test]
    fn chunks_respect_minimum_size() {
        if transcode_workers(POLICY.max_workers) <= 1 {
            return;
        }
        let Some(rows) = POLICY.chunk_rows(2_160, 3_840) else {
            panic!("a 4K frame should be split");
        };
        assert!(rows * 3_840 >= POLICY.min_chunk_pixels);
        assert!(rows < 2_160);
    }
}
