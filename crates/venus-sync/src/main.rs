#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;
use venus_sync::driver::{DeviceCaps, DeviceHandle, QueueCreateFlags};
use venus_sync::{Device, QueueCreateInfo, RecordingRetireSink, Session, SoftDriver, SyncConfig};

const DEFAULT_QUEUES: u32 = 2;
const DEFAULT_SUBMITS: u64 = 1000;
const RETIRE_DEADLINE: Duration = Duration::from_secs(60);

fn env_or<T: std::str::FromStr>(var: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .ok()
            .with_context(|| format!("invalid {var}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = match SyncConfig::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("venus-sync-soak: {err}");
            std::process::exit(2);
        }
    };

    if let Err(err) = run(cfg) {
        eprintln!("venus-sync-soak: {err:#}");
        std::process::exit(1);
    }
}

fn run(cfg: SyncConfig) -> anyhow::Result<()> {
    let queue_count: u32 = env_or("VENUS_SYNC_SOAK_QUEUES", DEFAULT_QUEUES)?;
    let submits: u64 = env_or("VENUS_SYNC_SOAK_SUBMITS", DEFAULT_SUBMITS)?;
    if queue_count == 0 || queue_count as usize >= cfg.ring_count {
        bail!(
            "VENUS_SYNC_SOAK_QUEUES must be in 1..{} (got {queue_count})",
            cfg.ring_count
        );
    }

    let driver = Arc::new(SoftDriver::auto_signaling());
    let sink = Arc::new(RecordingRetireSink::new());
    let session = Session::new(1, sink.clone(), cfg);
    let device = Device::realize(
        &session,
        driver.clone(),
        DeviceHandle(1),
        DeviceCaps {
            external_fence_fd: false,
        },
        &[QueueCreateInfo {
            flags: QueueCreateFlags::empty(),
            family: 0,
            count: queue_count,
        }],
    )?;

    for (i, queue) in device.queues().iter().enumerate() {
        let ring_idx = i as u32 + 1;
        device.bind_ring(&session, queue, ring_idx)?;
        queue.assign_identity(&session, u64::from(ring_idx))?;
    }

    tracing::info!(queue_count, submits, "venus-sync-soak starting");
    let started = Instant::now();

    for fence_id in 1..=submits {
        let ring_idx = (fence_id % u64::from(queue_count)) as u32 + 1;
        device
            .submit_ring_fence(0, ring_idx, fence_id)
            .with_context(|| format!("submit fence_id {fence_id} on ring {ring_idx}"))?;
    }

    let expected = usize::try_from(submits).context("submit count does not fit in memory")?;
    if !sink.wait_for(expected, RETIRE_DEADLINE) {
        bail!(
            "only {} of {expected} fences retired within {RETIRE_DEADLINE:?}",
            sink.len()
        );
    }
    let elapsed = started.elapsed();

    let mut per_ring: BTreeMap<u32, Vec<u64>> = BTreeMap::new();
    for retirement in sink.retirements() {
        per_ring
            .entry(retirement.ring_idx)
            .or_default()
            .push(retirement.fence_id);
    }
    for (ring_idx, fence_ids) in &per_ring {
        if let Some(pair) = fence_ids.windows(2).find(|pair| pair[0] >= pair[1]) {
            bail!(
                "ring {ring_idx} retired fence_id {} after {}",
                pair[1],
                pair[0]
            );
        }
    }

    let drained = device.destroy(&session);
    tracing::info!(
        retired = expected,
        rings = per_ring.len(),
        drained,
        fences_created = driver.fences_created(),
        elapsed_ms = elapsed.as_millis() as u64,
        "venus-sync-soak finished"
    );
    Ok(())
}
