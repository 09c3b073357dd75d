use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use pretty_assertions::assert_eq;
use venus_sync::driver::{DeviceCaps, DeviceHandle, FenceHandle, QueueCreateFlags};
use venus_sync::{Device, QueueCreateInfo, RetireSink, Session, SoftDriver, SyncConfig};

/// Records each retirement together with the fences that were signalled when it was reported.
struct ObservingSink {
    driver: Arc<SoftDriver>,
    fences: Mutex<Vec<FenceHandle>>,
    seen: Mutex<Vec<(u64, Vec<bool>)>>,
    cond: Condvar,
}

impl RetireSink for ObservingSink {
    fn retire_fence(&self, _ctx_id: u32, _ring_idx: u32, fence_id: u64) {
        let signaled = self
            .fences
            .lock()
            .unwrap()
            .iter()
            .map(|fence| self.driver.fence_is_signaled(*fence))
            .collect();
        self.seen.lock().unwrap().push((fence_id, signaled));
        self.cond.notify_all();
    }
}

#[test]
fn reverse_signalled_fences_retire_in_submission_order() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let driver = Arc::new(SoftDriver::new());
    let sink = Arc::new(ObservingSink {
        driver: driver.clone(),
        fences: Mutex::new(Vec::new()),
        seen: Mutex::new(Vec::new()),
        cond: Condvar::new(),
    });
    let session = Session::new(
        1,
        sink.clone(),
        SyncConfig {
            fence_wait_timeout: Duration::from_millis(25),
            ..Default::default()
        },
    );
    let device = Device::realize(
        &session,
        driver.clone(),
        DeviceHandle(1),
        DeviceCaps::default(),
        &[QueueCreateInfo {
            flags: QueueCreateFlags::empty(),
            family: 0,
            count: 1,
        }],
    )?;
    let queue = device
        .lookup_queue(QueueCreateFlags::empty(), 0, 0)
        .ok_or_else(|| anyhow::anyhow!("queue 0 not realized"))?;
    device.bind_ring(&session, &queue, 1)?;
    queue.assign_identity(&session, 100)?;

    for fence_id in 1..=3 {
        device.submit_ring_fence(0, 1, fence_id)?;
    }
    let fences = driver.submitted_fences();
    *sink.fences.lock().unwrap() = fences.clone();

    driver.signal_fence(fences[2]);
    std::thread::sleep(Duration::from_millis(60));
    driver.signal_fence(fences[1]);
    std::thread::sleep(Duration::from_millis(60));
    assert!(sink.seen.lock().unwrap().is_empty());
    driver.signal_fence(fences[0]);

    let mut seen = sink.seen.lock().unwrap();
    while seen.len() < 3 {
        let (guard, timeout) = sink.cond.wait_timeout(seen, Duration::from_secs(10)).unwrap();
        seen = guard;
        assert!(!timeout.timed_out(), "retirements stalled at {}", seen.len());
    }
    let order: Vec<u64> = seen.iter().map(|(fence_id, _)| *fence_id).collect();
    assert_eq!(order, vec![1, 2, 3]);
    // Fence 1 was the last to signal, so every report saw all three complete.
    assert!(seen.iter().all(|(_, signaled)| signaled.iter().all(|s| *s)));
    drop(seen);

    device.destroy(&session);
    assert!(!session.is_fatal());
    assert_eq!(driver.live_fence_count(), 0);
    tracing::info!("queue sync end-to-end complete");
    Ok(())
}
