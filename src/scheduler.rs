// ABOUTME: SyncScheduler drives the perpetual replication cycle
// ABOUTME: Resolve watermark, tunnel, extract, transform, load, wait, repeat; failures end only the cycle

use anyhow::{Context, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::checkpoint::CheckpointStore;
use crate::config::ReplicatorConfig;
use crate::destination::{CallDestination, PostgresDestination};
use crate::extract::{BatchExtractor, ExtractMode};
use crate::model::Watermark;
use crate::source::{CallSource, MysqlSource};
use crate::transform::normalize_batch;
use crate::tunnel::TunnelManager;
use crate::watermark::WatermarkResolver;

/// Statistics from a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub mode: ExtractMode,
    pub watermark_before: Watermark,
    pub pages: u64,
    pub rows_extracted: u64,
    pub rows_loaded: u64,
    pub duration_ms: u64,
}

impl CycleStats {
    fn new(mode: ExtractMode, watermark_before: Watermark) -> Self {
        Self {
            mode,
            watermark_before,
            pages: 0,
            rows_extracted: 0,
            rows_loaded: 0,
            duration_ms: 0,
        }
    }
}

/// Move everything newer than `watermark` from `source` to `destination`.
///
/// Each page is transformed and committed before the next one is requested,
/// so memory stays bounded by the page size and a failure leaves every
/// earlier page in place. The resolver's checkpoint (if any) advances after
/// each committed page.
pub async fn replicate<S, D>(
    source: &mut S,
    destination: &mut D,
    resolver: &WatermarkResolver,
    watermark: Watermark,
    batch_size: usize,
    region_code: &str,
) -> Result<CycleStats>
where
    S: CallSource + ?Sized,
    D: CallDestination + ?Sized,
{
    let start = Instant::now();
    let mode = ExtractMode::for_watermark(watermark);
    let mut stats = CycleStats::new(mode, watermark);

    let total = match mode {
        ExtractMode::Bulk => {
            let total = source.count().await?;
            tracing::info!(
                "Destination is empty, bulk loading {} source rows in pages of {}",
                total,
                batch_size
            );
            Some(total)
        }
        ExtractMode::Incremental(since) => {
            tracing::info!("Fetching records newer than {}", since);
            None
        }
    };

    let mut extractor = BatchExtractor::new(mode, batch_size);
    while let Some(page) = extractor.next_page(source).await? {
        let normalized = normalize_batch(&page, region_code);
        let loaded = destination
            .append(&normalized)
            .await
            .with_context(|| format!("Failed to load page {}", extractor.pages()))?;

        stats.pages = extractor.pages();
        stats.rows_extracted = extractor.rows();
        stats.rows_loaded += loaded;

        if let Some(last) = extractor.cursor() {
            resolver.commit(last, loaded).await?;
        }

        match total {
            Some(total) => tracing::info!(
                "Page {} loaded: {} rows ({}/{} processed)",
                extractor.pages(),
                loaded,
                extractor.rows(),
                total
            ),
            None => tracing::info!("Page {} loaded: {} rows", extractor.pages(), loaded),
        }
    }

    if stats.rows_extracted == 0 {
        tracing::info!("No new records found");
    }

    stats.duration_ms = start.elapsed().as_millis() as u64;
    Ok(stats)
}

/// Runs sync cycles against the configured source and destination.
pub struct SyncScheduler {
    config: ReplicatorConfig,
    resolver: WatermarkResolver,
}

impl SyncScheduler {
    pub fn new(config: ReplicatorConfig) -> Self {
        let checkpoint = config.checkpoint_path.clone().map(CheckpointStore::new);
        let resolver = WatermarkResolver::new(&config.destination_url, checkpoint);
        Self { config, resolver }
    }

    /// Run a single sync cycle.
    ///
    /// The tunnel lives exactly as long as this call: it is closed on success
    /// and on error, and killed by drop if the future is cancelled.
    pub async fn run_cycle(&self) -> Result<CycleStats> {
        let mut destination =
            PostgresDestination::connect(&self.config.destination_url, self.config.load_mode)
                .await?;
        let watermark = self.resolver.resolve(&mut destination).await;
        tracing::info!("Current watermark: {}", watermark);

        let manager = TunnelManager::new(
            self.config.bastion.as_ref(),
            &self.config.source.endpoint,
            self.config.tunnel_timeout,
        );
        let tunnel = manager.open().await?;

        let result = async {
            let mut source = MysqlSource::connect(&self.config.source, tunnel.endpoint()).await?;
            let stats = replicate(
                &mut source,
                &mut destination,
                &self.resolver,
                watermark,
                self.config.batch_size,
                &self.config.region_code,
            )
            .await;
            if let Err(e) = source.disconnect().await {
                tracing::debug!("{:#}", e);
            }
            stats
        }
        .await;

        if let Err(e) = tunnel.close().await {
            tracing::warn!("{:#}", e);
        }
        result
    }

    async fn run_bounded_cycle(&self) -> Result<CycleStats> {
        match self.config.cycle_timeout {
            Some(limit) => tokio::time::timeout(limit, self.run_cycle())
                .await
                .with_context(|| format!("Sync cycle exceeded {:?}", limit))?,
            None => self.run_cycle().await,
        }
    }

    /// Run the scheduler until a shutdown signal arrives.
    ///
    /// A failed cycle is logged and followed by the normal wait; there is no
    /// backoff and no retry limit.
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        tracing::info!(
            "Starting SyncScheduler with sync_interval={:?}, batch_size={}",
            self.config.sync_interval,
            self.config.batch_size
        );

        run_loop(|| self.run_bounded_cycle(), self.config.sync_interval, shutdown).await
    }
}

/// Drive `cycle` forever, `interval` apart, until `shutdown` fires.
async fn run_loop<F, Fut>(
    mut cycle: F,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<CycleStats>>,
{
    let mut cycles = 0u64;

    loop {
        cycles += 1;
        tracing::info!("Starting sync cycle {}", cycles);

        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                tracing::info!("Shutdown signal received during sync cycle, aborting");
                break;
            }
            result = cycle() => {
                match result {
                    Ok(stats) => tracing::info!(
                        "Sync cycle {} completed: {} rows in {} pages ({} loaded) in {}ms",
                        cycles,
                        stats.rows_extracted,
                        stats.pages,
                        stats.rows_loaded,
                        stats.duration_ms
                    ),
                    Err(e) => tracing::error!("Sync cycle {} failed: {:#}", cycles, e),
                }
            }
        }

        tracing::info!("Waiting {:?} before the next cycle", interval);
        if wait_or_shutdown(interval, &mut shutdown).await {
            tracing::info!("Shutdown signal received, stopping SyncScheduler");
            break;
        }
    }

    Ok(())
}

/// Sleep for `interval`; returns `true` if shutdown was requested first.
async fn wait_or_shutdown(interval: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.recv() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}
