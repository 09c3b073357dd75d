use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use venus_sync::dispatch::{self, DeviceQueueInfo2, QueueTimelineInfo};
use venus_sync::driver::{DeviceCaps, DeviceHandle, QueueCreateFlags};
use venus_sync::{
    Device, ProtocolViolation, QueueCreateInfo, RecordingRetireSink, Session, SoftDriver,
    SyncConfig, SyncError,
};

fn setup(ring_count: usize) -> (Arc<SoftDriver>, Arc<RecordingRetireSink>, Session, Device) {
    let driver = Arc::new(SoftDriver::auto_signaling());
    let sink = Arc::new(RecordingRetireSink::new());
    let session = Session::new(
        3,
        sink.clone(),
        SyncConfig {
            ring_count,
            ..Default::default()
        },
    );
    let device = Device::realize(
        &session,
        driver.clone(),
        DeviceHandle(9),
        DeviceCaps::default(),
        &[
            QueueCreateInfo {
                flags: QueueCreateFlags::empty(),
                family: 0,
                count: 2,
            },
            QueueCreateInfo {
                flags: QueueCreateFlags::PROTECTED,
                family: 1,
                count: 1,
            },
        ],
    )
    .unwrap();
    (driver, sink, session, device)
}

fn queue_info(family: u32, index: u32, ring_idx: Option<u32>) -> DeviceQueueInfo2 {
    DeviceQueueInfo2 {
        flags: if family == 1 {
            QueueCreateFlags::PROTECTED
        } else {
            QueueCreateFlags::empty()
        },
        family,
        index,
        timeline: ring_idx.map(|ring_idx| QueueTimelineInfo { ring_idx }),
    }
}

#[test]
fn ring_addressed_fences_reach_the_bound_queue() {
    let (_driver, sink, session, device) = setup(8);
    dispatch::get_device_queue2(&session, &device, &queue_info(0, 1, Some(3)), 30).unwrap();
    dispatch::get_device_queue2(&session, &device, &queue_info(1, 0, Some(4)), 40).unwrap();

    device.submit_ring_fence(0, 3, 1).unwrap();
    device.submit_ring_fence(0, 4, 2).unwrap();
    assert!(sink.wait_for(2, Duration::from_secs(10)));

    let mut rings: Vec<(u32, u64)> = sink
        .retirements()
        .iter()
        .map(|r| (r.ring_idx, r.fence_id))
        .collect();
    rings.sort_unstable();
    assert_eq!(rings, vec![(3, 1), (4, 2)]);
    assert_eq!(session.objects().queue(40).unwrap().family(), 1);

    device.destroy(&session);
    assert!(session.objects().is_empty());
}

#[test]
fn unbound_ring_fails_only_the_submission() {
    let (_driver, _sink, session, device) = setup(8);
    let err = device.submit_ring_fence(0, 2, 1).unwrap_err();
    assert!(matches!(err, SyncError::UnboundRing(2)));
    assert!(!err.is_fatal());
    assert!(!session.is_fatal());
}

#[test]
fn ring_table_conflicts_are_fatal() {
    let (_driver, _sink, session, device) = setup(8);
    dispatch::get_device_queue2(&session, &device, &queue_info(0, 0, Some(2)), 10).unwrap();

    let err = dispatch::get_device_queue2(&session, &device, &queue_info(0, 1, Some(2)), 11)
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Protocol(ProtocolViolation::RingAlreadyBound(2))
    ));
    assert!(session.is_fatal());
    // The slot still belongs to the first queue.
    assert_eq!(device.ring_queue(2).unwrap().index(), 0);
}

#[test]
fn rebinding_a_bound_queue_is_fatal_even_to_the_same_ring() {
    let (_driver, _sink, session, device) = setup(8);
    dispatch::get_device_queue2(&session, &device, &queue_info(0, 0, Some(2)), 10).unwrap();

    let err = dispatch::get_device_queue2(&session, &device, &queue_info(0, 0, Some(2)), 10)
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Protocol(ProtocolViolation::QueueAlreadyBound {
            queue_ring: 2,
            requested: 2
        })
    ));
    assert!(session.is_fatal());
}

#[test]
fn out_of_range_ring_is_fatal() {
    let (_driver, _sink, session, device) = setup(4);
    let err = dispatch::get_device_queue2(&session, &device, &queue_info(0, 0, Some(4)), 10)
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Protocol(ProtocolViolation::InvalidRingIndex(4))
    ));
    assert!(device.ring_queue(4).is_none());
}

#[test]
fn plain_lookup_ignores_protected_queues() {
    let (_driver, _sink, session, device) = setup(4);
    // Family 1 only has a protected queue, which `vkGetDeviceQueue` cannot name.
    assert!(dispatch::get_device_queue(&session, &device, 1, 0, 5).is_err());
    assert!(session.is_fatal());
}

proptest! {
    #[test]
    fn identity_binds_once(first in 1u64..1000, second in 1u64..1000, repeats in 1usize..4) {
        let (_driver, _sink, session, device) = setup(4);
        for _ in 0..repeats {
            dispatch::get_device_queue(&session, &device, 0, 0, first).unwrap();
        }
        prop_assert!(!session.is_fatal());
        prop_assert_eq!(device.lookup_queue(QueueCreateFlags::empty(), 0, 0).unwrap().id(), first);

        let result = dispatch::get_device_queue(&session, &device, 0, 0, second);
        if second == first {
            prop_assert!(result.is_ok());
            prop_assert!(!session.is_fatal());
        } else {
            prop_assert_eq!(
                result.unwrap_err().to_string(),
                format!(
                    "protocol violation: queue already has object id {first}, client supplied {second}"
                )
            );
            prop_assert!(session.is_fatal());
        }
        prop_assert_eq!(device.lookup_queue(QueueCreateFlags::empty(), 0, 0).unwrap().id(), first);
        prop_assert_eq!(session.objects().len(), 1);
    }
}
