//! Integration tests for the buffer core operations.

use bufcore::{BufcoreError, BufferCore, FrameId, LatchMode, PageId, PoolConfig, Timeout};

/// Installs `id` through the miss path: replacement, handoff, grab, publish.
/// Returns the frame, left unpinned and unlatched.
fn install(core: &BufferCore, id: PageId) -> FrameId {
    let frame = core.replacement().expect("replacement frame");
    core.publish_partial(frame);
    let (frame, found) = core
        .grab(frame, id, LatchMode::Exclusive, Timeout::Forever)
        .expect("grab");
    assert!(!found, "{id} was unexpectedly resident");
    core.publish(frame, LatchMode::Exclusive, false);
    core.unpin(frame, 0);
    frame
}

// =============================================================================
// Fetch path scenarios
// =============================================================================

mod fetch_scenarios {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_five_pages_in_four_frames() {
        let config = PoolConfig::new(4).with_slots_per_bucket(3).with_hash_functions(2);
        let core = BufferCore::new(config).expect("create core");
        let ids: Vec<PageId> = (0..5).map(|p| PageId::main(100 + p)).collect();

        for &id in &ids {
            install(&core, id);
        }
        assert_eq!(core.snapshot().resident, 4);
        assert_eq!(core.snapshot().free, 0);

        let mut missing = 0;
        for &id in &ids {
            match core.find(id, LatchMode::Shared, Timeout::Immediate, 0) {
                Ok(frame) => {
                    assert_eq!(core.block(frame).page_id(), id);
                    assert_eq!(core.latch_mode(frame), LatchMode::Shared);
                    assert_eq!(core.latched_by_me(frame), 1);
                    core.unpin(frame, 0);
                }
                Err(BufcoreError::NotFound(missing_id)) => {
                    assert_eq!(missing_id, id);
                    missing += 1;
                }
                Err(err) => panic!("unexpected error for {id}: {err}"),
            }
        }
        assert_eq!(missing, 1);
        assert_eq!(core.snapshot().pinned, 0);
        core.audit().expect("audit");
    }

    #[test]
    fn test_find_before_and_after_concurrent_install() {
        let core = Arc::new(BufferCore::new(PoolConfig::new(8)).expect("create core"));
        let id = PageId::new(4, 2);

        let (replaced_tx, replaced_rx) = mpsc::channel();
        let (checked_tx, checked_rx) = mpsc::channel();
        let (installed_tx, installed_rx) = mpsc::channel();

        let installer_core = Arc::clone(&core);
        let installer = thread::spawn(move || {
            let frame = installer_core.replacement().expect("replacement");
            replaced_tx.send(()).expect("send");
            checked_rx.recv().expect("recv");

            let (frame, found) = installer_core
                .grab(frame, id, LatchMode::Exclusive, Timeout::Forever)
                .expect("grab");
            assert!(!found);
            installer_core.publish(frame, LatchMode::Exclusive, false);
            installer_core.unpin(frame, 0);
            installed_tx.send(frame).expect("send");
        });

        replaced_rx.recv().expect("recv");
        assert!(matches!(
            core.find(id, LatchMode::Shared, Timeout::Immediate, 0),
            Err(BufcoreError::NotFound(_))
        ));
        checked_tx.send(()).expect("send");

        let installed = installed_rx.recv().expect("recv");
        let frame = core
            .find(id, LatchMode::Shared, Timeout::Immediate, 0)
            .expect("find after install");
        assert_eq!(frame, installed);
        core.unpin(frame, 0);
        installer.join().expect("installer thread");
    }

    #[test]
    fn test_racing_installers_share_one_frame() {
        let core = Arc::new(BufferCore::new(PoolConfig::new(16)).expect("create core"));
        let id = PageId::main(77);
        let barrier = Arc::new(std::sync::Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let core = Arc::clone(&core);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let candidate = core.replacement().expect("replacement");
                    barrier.wait();
                    let (frame, found) = core
                        .grab(candidate, id, LatchMode::Shared, Timeout::Forever)
                        .expect("grab");
                    if !found {
                        core.publish(frame, LatchMode::Shared, false);
                    }
                    core.unpin(frame, 0);
                    (frame, found)
                })
            })
            .collect();

        let results: Vec<(FrameId, bool)> =
            handles.into_iter().map(|h| h.join().expect("join")).collect();
        let installs = results.iter().filter(|(_, found)| !found).count();
        assert_eq!(installs, 1);
        assert!(results.windows(2).all(|w| w[0].0 == w[1].0));
        assert_eq!(core.snapshot().resident, 1);
        assert_eq!(core.snapshot().free, 15);
        core.audit().expect("audit");
    }
}

// =============================================================================
// Removal and transit
// =============================================================================

mod removal {
    use super::*;
    use bufcore::Lsn;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_remove_frees_frame() {
        let core = BufferCore::new(PoolConfig::new(4)).expect("create core");
        let id = PageId::main(1);
        install(&core, id);
        assert_eq!(core.snapshot().free, 3);

        core.remove(id).expect("remove");
        assert_eq!(core.snapshot().free, 4);
        assert_eq!(core.snapshot().resident, 0);
        core.audit().expect("audit");
    }

    #[test]
    fn test_remove_waits_for_write_back() {
        let core = Arc::new(BufferCore::new(PoolConfig::new(4)).expect("create core"));
        let id = PageId::main(2);
        let frame = install(&core, id);
        core.mark_dirty(frame, Lsn(40));

        let write_guard = core.write_locks().lock(id);
        core.begin_write_back(frame);

        let remover_core = Arc::clone(&core);
        let remover = thread::spawn(move || remover_core.remove(id));

        thread::sleep(Duration::from_millis(30));
        core.end_write_back(frame);
        drop(write_guard);

        remover.join().expect("join").expect("remove after write-back");
        assert_eq!(core.snapshot().resident, 0);
    }

    #[test]
    fn test_regrab_waits_for_transit() {
        let core = Arc::new(BufferCore::new(PoolConfig::new(2)).expect("create core"));
        let id = PageId::main(5);
        let frame = install(&core, id);
        core.mark_dirty(frame, Lsn(9));

        let (ready_tx, ready_rx) = mpsc::channel();
        let (evicted_tx, evicted_rx) = mpsc::channel();
        let published = Arc::new(AtomicBool::new(false));

        let grabber_core = Arc::clone(&core);
        let grabber_published = Arc::clone(&published);
        let grabber = thread::spawn(move || {
            // Takes the last free frame before the eviction below.
            let candidate = grabber_core.replacement().expect("replacement");
            ready_tx.send(()).expect("send");
            evicted_rx.recv().expect("recv");

            let (frame, found) = grabber_core
                .grab(candidate, id, LatchMode::Shared, Timeout::Forever)
                .expect("grab");
            assert!(!found);
            assert!(grabber_published.load(Ordering::SeqCst));
            grabber_core.publish(frame, LatchMode::Shared, false);
            grabber_core.unpin(frame, 0);
        });

        ready_rx.recv().expect("recv");
        let victim = core.replacement().expect("replacement");
        assert_eq!(victim, frame);
        assert_eq!(core.snapshot().in_transit, 1);
        assert_eq!(core.transit().max_occupancy(), 1);
        evicted_tx.send(()).expect("send");

        thread::sleep(Duration::from_millis(30));
        published.store(true, Ordering::SeqCst);
        core.publish_partial(victim);
        core.discard_unbound(victim);

        grabber.join().expect("grabber thread");
        assert_eq!(core.snapshot().in_transit, 0);
        assert_eq!(core.snapshot().resident, 1);
        core.audit().expect("audit");
    }
}

// =============================================================================
// Property-based tests for index correctness
// =============================================================================

mod proptest_index {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Property: every installed page is found in the frame it was installed in.
        #[test]
        fn test_install_then_find(pages in proptest::collection::hash_set((0..4u32, 0..100_000u32), 1..48)) {
            let core = BufferCore::new(PoolConfig::new(48)).expect("create core");
            let mut installed = Vec::new();
            for &(volume, page) in &pages {
                let id = PageId::new(volume, page);
                installed.push((id, install(&core, id)));
            }

            for (id, frame) in installed {
                let found = core.find(id, LatchMode::Shared, Timeout::Immediate, 0).expect("find");
                prop_assert_eq!(found, frame);
                core.unpin(found, 0);
            }
            prop_assert_eq!(core.snapshot().resident, pages.len());
            prop_assert_eq!(core.snapshot().pinned, 0);
            prop_assert!(core.audit().is_ok());
        }
    }
}
