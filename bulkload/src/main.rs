use std::sync::Arc;

use bulkload::btree::TreeReader;
use bulkload::bulk::{IndexBuild, StallCounter};
use bulkload::config::{BulkLoadConfig, DriverConfig};
use bulkload::storage::{BufferPool, DatabaseFile, PageStore, Tablespace};
use bulkload::{BytewiseComparator, Row};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Rows `start..end` of the generated data set. Keys are zero-padded so that
/// byte order matches numeric order.
fn partition(start: u64, end: u64, seed: u64, max_value_len: usize) -> impl Iterator<Item = Row> {
    let mut rng = StdRng::seed_from_u64(seed ^ start);
    (start..end).map(move |i| {
        let len = rng.random_range(0..=max_value_len);
        let mut value = vec![0u8; len];
        rng.fill(value.as_mut_slice());
        Row::new(format!("key-{i:016}"), value)
    })
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bulkload=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let driver = match DriverConfig::from_env() {
        Ok(driver) => driver,
        Err(e) => {
            tracing::error!("Failed to load driver configuration: {e}");
            std::process::exit(1);
        }
    };
    let config = match BulkLoadConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load bulk load configuration: {e}");
            std::process::exit(1);
        }
    };
    if driver.workers > config.max_builders() {
        tracing::error!(
            "{} workers need {} page buffers, but BULKLOAD_BUFFER_POOL_PAGES is {}",
            driver.workers,
            driver.workers.saturating_mul(config.buffers_per_builder()),
            config.buffer_pool_pages
        );
        std::process::exit(1);
    }
    tracing::info!(
        "Loaded configuration: output={}, rows={}, workers={}",
        driver.output.display(),
        driver.rows,
        driver.workers
    );

    let pool = BufferPool::new(config.buffer_pool_pages);
    let file = match DatabaseFile::create(&driver.output, Arc::clone(&pool)) {
        Ok(file) => Arc::new(file),
        Err(e) => {
            tracing::error!("Failed to create {}: {e}", driver.output.display());
            std::process::exit(1);
        }
    };
    let space = Arc::new(match config.max_pages {
        Some(limit) => Tablespace::with_limit(file.total_pages(), limit),
        None => Tablespace::new(file.total_pages()),
    });

    let workers = driver.workers as u64;
    let per_worker = driver.rows.div_ceil(workers);
    let partitions: Vec<_> = (0..workers)
        .map(|w| {
            let start = (w * per_worker).min(driver.rows);
            let end = (start + per_worker).min(driver.rows);
            partition(start, end, driver.seed, driver.max_value_len)
        })
        .collect();

    let stalls = Arc::new(StallCounter::default());
    let store: Arc<dyn PageStore> = file.clone();
    let build = IndexBuild::new(config, store, Arc::clone(&space))
        .with_buffer_pool(pool)
        .with_observer(stalls.clone());
    let output = match build.run(partitions) {
        Ok(output) => output,
        Err(e) => {
            tracing::error!("Bulk load failed: {e}");
            std::process::exit(1);
        }
    };

    let comparator = BytewiseComparator;
    let reader = TreeReader::new(file.as_ref(), &comparator);
    let tree = match reader.verify(output.root.page) {
        Ok(tree) => tree,
        Err(e) => {
            tracing::error!("Built index failed verification: {e}");
            std::process::exit(1);
        }
    };

    let stalls = stalls.stats();
    tracing::info!(
        root = output.root.page,
        height = tree.root_level + 1,
        records = tree.records,
        external_values = tree.external_values,
        node_pages = tree.node_pages(),
        pages_written = output.stats.pages_written,
        allocation_waits = stalls.allocation_waits,
        flush_waits = stalls.flush_waits,
        elapsed_ms = output.stats.elapsed.as_millis(),
        "index verified"
    );
    println!(
        "root={} height={} records={} pages={}",
        output.root.page,
        tree.root_level + 1,
        tree.records,
        tree.node_pages()
    );
}
