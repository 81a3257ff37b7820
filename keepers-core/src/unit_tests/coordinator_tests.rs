// Copyright (c) Zefchain Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use keepers_base::{
    identifiers::{BlockKey, UpkeepIdentifier, UpkeepKey},
    time::{timer, Duration},
};
use proptest::strategy::Strategy as _;
use rand::{rngs::StdRng, seq::SliceRandom as _, SeedableRng as _};
use test_case::test_case;
use test_strategy::proptest;

use super::{IdBlocker, ReportCoordinator};
use crate::{
    environment,
    test_utils::{perform_log, TestHandles},
};

const LOCKOUT: Duration = Duration::from_secs(20 * 60);

fn key(block: u64, identifier: u64) -> UpkeepKey {
    UpkeepKey::new(BlockKey(block), UpkeepIdentifier::from(identifier))
}

fn blocker(check_block: u64, transmit_block: BlockKey) -> IdBlocker {
    IdBlocker {
        check_block: BlockKey(check_block),
        transmit_block,
    }
}

fn coordinator(
    handles: &TestHandles,
    min_confirmations: i64,
) -> ReportCoordinator<environment::Test> {
    ReportCoordinator::new(
        handles.environment(),
        LOCKOUT,
        min_confirmations,
        Duration::from_secs(1),
        Duration::from_secs(30),
    )
}

#[test_case(blocker(10, BlockKey::INDEFINITE), blocker(11, BlockKey::INDEFINITE), true; "later check block")]
#[test_case(blocker(10, BlockKey(15)), blocker(11, BlockKey::INDEFINITE), true; "later check block while confirmed")]
#[test_case(blocker(10, BlockKey::INDEFINITE), blocker(10, BlockKey(12)), true; "confirmation of pending")]
#[test_case(blocker(10, BlockKey(12)), blocker(10, BlockKey(14)), true; "later transmit block")]
#[test_case(blocker(10, BlockKey(14)), blocker(10, BlockKey(12)), false; "earlier transmit block")]
#[test_case(blocker(10, BlockKey(12)), blocker(10, BlockKey::INDEFINITE), false; "pending never supersedes confirmed")]
#[test_case(blocker(10, BlockKey(12)), blocker(9, BlockKey(30)), false; "earlier check block")]
#[test_case(blocker(10, BlockKey(12)), blocker(10, BlockKey(12)), false; "same blocker")]
fn test_should_update(current: IdBlocker, new: IdBlocker, expected: bool) {
    assert_eq!(current.should_update(&new), expected);
}

fn merge(blockers: &[IdBlocker]) -> Option<IdBlocker> {
    let mut state: Option<IdBlocker> = None;
    for new in blockers {
        match state {
            Some(current) if !current.should_update(new) => {}
            _ => state = Some(*new),
        }
    }
    state
}

fn blockers() -> impl proptest::strategy::Strategy<Value = Vec<IdBlocker>> {
    // A transmit block of 6 stands for the indefinite sentinel.
    proptest::collection::vec((0u64..6, 0u64..7), 1..24).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(check, transmit)| {
                let transmit = if transmit == 6 {
                    BlockKey::INDEFINITE
                } else {
                    BlockKey(check + transmit)
                };
                blocker(check, transmit)
            })
            .collect()
    })
}

#[proptest]
fn test_merge_is_order_independent(
    #[strategy(blockers())] blockers: Vec<IdBlocker>,
    seed: u64,
) {
    let expected = merge(&blockers);
    let mut shuffled = blockers.clone();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
    assert_eq!(merge(&shuffled), expected);

    let mut reversed = blockers;
    reversed.reverse();
    assert_eq!(merge(&reversed), expected);
}

#[tokio::test]
async fn test_accept_blocks_the_upkeep() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    let filter = coordinator.filter();
    let accepted = key(10, 1);

    assert!(filter(&accepted));
    assert!(coordinator.is_transmission_confirmed(&accepted));

    coordinator.accept(&accepted);

    assert!(!filter(&key(5, 1)));
    assert!(!filter(&accepted));
    assert!(!filter(&key(1_000_000, 1)));
    assert!(filter(&key(10, 2)));
    assert!(!coordinator.is_transmission_confirmed(&accepted));
    assert!(coordinator.is_pending(&accepted));
    assert_eq!(
        coordinator.id_blocker(&accepted.identifier),
        Some(blocker(10, BlockKey::INDEFINITE))
    );
}

#[tokio::test]
async fn test_perform_log_unblocks_after_transmit_block() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    let filter = coordinator.filter();
    let accepted = key(10, 1);
    coordinator.accept(&accepted);

    handles.logs.add_perform_log(perform_log(accepted.clone(), 15, 1));
    coordinator.poll_logs().await.unwrap();

    assert!(coordinator.is_transmission_confirmed(&accepted));
    assert!(!coordinator.is_pending(&accepted));
    assert_eq!(
        coordinator.id_blocker(&accepted.identifier),
        Some(blocker(10, BlockKey(15)))
    );
    assert!(!filter(&key(15, 1)));
    assert!(filter(&key(16, 1)));
}

#[tokio::test]
async fn test_accept_is_idempotent() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    let accepted = key(10, 1);
    coordinator.accept(&accepted);
    coordinator.accept(&accepted);
    assert_eq!(
        coordinator.id_blocker(&accepted.identifier),
        Some(blocker(10, BlockKey::INDEFINITE))
    );

    handles.logs.add_perform_log(perform_log(accepted.clone(), 12, 1));
    coordinator.poll_logs().await.unwrap();
    coordinator.accept(&accepted);

    assert!(coordinator.is_transmission_confirmed(&accepted));
    assert_eq!(
        coordinator.id_blocker(&accepted.identifier),
        Some(blocker(10, BlockKey(12)))
    );
}

#[tokio::test]
async fn test_stale_log_unblocks_after_check_block() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    let filter = coordinator.filter();
    let accepted = key(20, 2);
    coordinator.accept(&accepted);

    handles.logs.add_stale_log(perform_log(accepted.clone(), 40, 1));
    coordinator.poll_logs().await.unwrap();

    assert!(coordinator.is_transmission_confirmed(&accepted));
    assert_eq!(
        coordinator.id_blocker(&accepted.identifier),
        Some(blocker(20, BlockKey(21)))
    );
    assert!(!filter(&key(21, 2)));
    assert!(filter(&key(22, 2)));
}

#[tokio::test]
async fn test_logs_below_min_confirmations_are_ignored() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 3);
    let accepted = key(10, 1);
    coordinator.accept(&accepted);

    handles.logs.add_perform_log(perform_log(accepted.clone(), 15, 2));
    coordinator.poll_logs().await.unwrap();
    assert!(coordinator.is_pending(&accepted));

    handles.logs.add_perform_log(perform_log(accepted.clone(), 15, 3));
    coordinator.poll_logs().await.unwrap();
    assert!(!coordinator.is_pending(&accepted));
}

#[tokio::test]
async fn test_reorged_perform_moves_transmit_block() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    let accepted = key(10, 1);
    coordinator.accept(&accepted);

    handles.logs.add_perform_log(perform_log(accepted.clone(), 15, 1));
    coordinator.poll_logs().await.unwrap();
    handles.logs.add_perform_log(perform_log(accepted.clone(), 17, 1));
    coordinator.poll_logs().await.unwrap();

    assert_eq!(
        coordinator.id_blocker(&accepted.identifier),
        Some(blocker(10, BlockKey(17)))
    );
}

#[tokio::test]
async fn test_logs_of_unknown_keys_are_ignored() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    handles.logs.add_perform_log(perform_log(key(10, 7), 15, 1));
    coordinator.poll_logs().await.unwrap();

    assert_eq!(coordinator.id_blocker(&UpkeepIdentifier::from(7)), None);
    assert!(coordinator.is_transmission_confirmed(&key(10, 7)));
}

#[tokio::test]
async fn test_later_accept_blocks_again() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    let filter = coordinator.filter();
    coordinator.accept(&key(10, 1));
    handles.logs.add_perform_log(perform_log(key(10, 1), 15, 1));
    coordinator.poll_logs().await.unwrap();

    coordinator.accept(&key(30, 1));

    assert!(!filter(&key(31, 1)));
    assert_eq!(
        coordinator.id_blocker(&UpkeepIdentifier::from(1)),
        Some(blocker(30, BlockKey::INDEFINITE))
    );
}

#[tokio::test(start_paused = true)]
async fn test_blocks_expire_after_lockout_window() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    let filter = coordinator.filter();
    coordinator.accept(&key(10, 1));
    assert!(!filter(&key(11, 1)));

    timer::advance(LOCKOUT + Duration::from_secs(1)).await;

    assert!(filter(&key(11, 1)));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_polling_loop_runs_until_stopped() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    let accepted = key(10, 1);
    coordinator.accept(&accepted);
    coordinator.start();
    coordinator.start();

    handles.logs.add_perform_log(perform_log(accepted.clone(), 11, 1));
    timer::sleep(Duration::from_millis(3_500)).await;

    assert!(coordinator.is_transmission_confirmed(&accepted));
    let polls = handles.logs.polls();
    assert!((3..=5).contains(&polls), "unexpected number of polls: {polls}");

    coordinator.stop();
    coordinator.stop();
    assert!(coordinator.is_stopped());
    timer::sleep(Duration::from_secs(5)).await;
    assert_eq!(handles.logs.polls(), polls);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_failed_polls_are_retried() {
    let handles = TestHandles::default();
    let coordinator = coordinator(&handles, 0);
    let accepted = key(10, 1);
    coordinator.accept(&accepted);
    handles.logs.add_perform_log(perform_log(accepted.clone(), 11, 1));
    handles.logs.set_failing(true);
    coordinator.start();

    timer::sleep(Duration::from_millis(1_500)).await;
    assert!(coordinator.is_pending(&accepted));

    handles.logs.set_failing(false);
    timer::sleep(Duration::from_secs(1)).await;
    assert!(!coordinator.is_pending(&accepted));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_slow_polls_restart_without_sleeping() {
    let handles = TestHandles::default();
    handles.logs.set_delay(Some(Duration::from_millis(1_500)));
    let coordinator = coordinator(&handles, 0);
    coordinator.start();

    // Passes start at 0s, 1.5s and 3s. Sleeping a full interval after each would delay
    // the second one to 2.5s.
    timer::sleep(Duration::from_millis(3_100)).await;
    assert_eq!(handles.logs.polls(), 3);

    coordinator.stop();
}
