use std::sync::OnceLock;

/// Pre-initialize the comparison thread pool so the first frame doesn't
/// pay the pool-creation cost. Safe to call multiple times; only the first
/// call has any effect.
pub(crate) fn warmup_pool(max_workers: usize) {
    install_compare_pool(max_workers, || {});
}

#[inline(always)]
pub(crate) fn should_parallelize(
    pixel_count: usize,
    min_pixels: usize,
    min_chunk_pixels: usize,
    max_workers: usize,
) -> bool {
    let workers = compare_workers(max_workers);
    if workers <= 1 {
        return false;
    }
    let min_chunk_total = min_chunk_pixels.saturating_mul(workers);
    pixel_count >= min_pixels.max(min_chunk_total)
}

/// Rows per parallel chunk so each worker gets roughly `pixel_count / workers`
/// pixels. `None` when the split would leave fewer than two chunks.
#[inline(always)]
pub(crate) fn parallel_chunk_rows(
    width: usize,
    height: usize,
    min_chunk_pixels: usize,
    max_workers: usize,
) -> Option<usize> {
    let workers = compare_workers(max_workers);
    let rows = height / workers;
    if rows == 0 || rows * width < min_chunk_pixels || height.div_ceil(rows) < 2 {
        return None;
    }
    Some(rows)
}

#[inline]
pub(crate) fn compare_workers(max_workers: usize) -> usize {
    static WORKERS: OnceLock<usize> = OnceLock::new();
    (*WORKERS.get_or_init(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }))
    .min(max_workers.max(1))
}

static COMPARE_POOL: OnceLock<Option<rayon::ThreadPool>> = OnceLock::new();

pub(crate) fn compare_pool_initialized() -> bool {
    COMPARE_POOL.get().is_some()
}

#[inline]
pub(crate) fn install_compare_pool<R, F>(max_workers: usize, job: F) -> R
where
    R: Send,
    F: FnOnce() -> R + Send,
{
    if let Some(pool) = COMPARE_POOL
        .get_or_init(|| {
            let workers = compare_workers(max_workers);
            if workers <= 1 {
                return None;
            }
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("fbmirror-compare-{i}"))
                .build()
                .ok()
        })
        .as_ref()
    {
        pool.install(job)
    } else {
        job()
    }
}
