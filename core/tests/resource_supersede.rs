//! End-to-end supersession behavior of the resource controller.

use loadstone_core::ResourceController;
use loadstone_types::Outcome;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn profile_load_emits_progress_then_success() {
    let controller = ResourceController::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    controller.launch("profile", None::<i32>, tx, |cx| async move {
        sleep(Duration::from_millis(500)).await;
        cx.emit(Outcome::success(10));
        Ok(())
    });

    sleep(Duration::from_millis(600)).await;

    let mut seen = Vec::new();
    while let Ok(o) = rx.try_recv() {
        seen.push(o);
    }
    assert_eq!(seen.len(), 2);
    assert!(seen[0].is_progress());
    assert_eq!(seen[0].data(), None);
    assert!(seen[1].is_success());
    assert_eq!(seen[1].data(), Some(&10));
}

#[tokio::test(start_paused = true)]
async fn superseding_launch_wins_and_old_value_never_appears() {
    let controller = ResourceController::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    controller.launch("profile", None::<i32>, tx.clone(), |cx| async move {
        sleep(Duration::from_millis(500)).await;
        cx.emit(Outcome::success(10));
        Ok(())
    });

    sleep(Duration::from_millis(100)).await;

    controller.launch("profile", None::<i32>, tx, |cx| async move {
        sleep(Duration::from_millis(500)).await;
        cx.emit(Outcome::success(20));
        Ok(())
    });

    sleep(Duration::from_secs(1)).await;

    let mut seen = Vec::new();
    while let Ok(o) = rx.try_recv() {
        seen.push(o);
    }

    // First generation got as far as its initial Progress before being
    // superseded; the second generation owns the rest of the stream.
    assert!(seen.iter().all(|o| o.data() != Some(&10)));
    let terminals: Vec<_> = seen.iter().filter(|o| o.is_terminal()).collect();
    assert_eq!(terminals.len(), 1);
    assert!(terminals[0].is_success());
    assert_eq!(terminals[0].data(), Some(&20));
}

#[tokio::test(start_paused = true)]
async fn fresh_watch_subscriber_sees_only_the_winning_outcome() {
    let controller = ResourceController::new();
    let (tx, _keepalive) = watch::channel(Outcome::<i32>::progress(None));

    controller.launch("profile", None::<i32>, tx.clone(), |cx| async move {
        sleep(Duration::from_millis(500)).await;
        cx.emit(Outcome::success(10));
        Ok(())
    });
    sleep(Duration::from_millis(100)).await;
    controller.launch("profile", None::<i32>, tx.clone(), |cx| async move {
        sleep(Duration::from_millis(500)).await;
        cx.emit(Outcome::success(20));
        Ok(())
    });

    sleep(Duration::from_secs(1)).await;

    // A subscriber attaching after the dust settles observes the second
    // generation's terminal value, never a 10-carrying one.
    let current = tx.borrow().clone();
    assert!(current.is_success());
    assert_eq!(current.data(), Some(&20));
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_run_independently() {
    let controller = ResourceController::new();
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();

    controller.launch("a", None::<i32>, tx_a, |cx| async move {
        sleep(Duration::from_millis(100)).await;
        cx.emit(Outcome::success(1));
        Ok(())
    });
    controller.launch("b", None::<i32>, tx_b, |cx| async move {
        sleep(Duration::from_millis(200)).await;
        cx.emit(Outcome::success(2));
        Ok(())
    });

    sleep(Duration::from_millis(300)).await;

    let mut last_a = None;
    while let Ok(o) = rx_a.try_recv() {
        last_a = Some(o);
    }
    let mut last_b = None;
    while let Ok(o) = rx_b.try_recv() {
        last_b = Some(o);
    }
    assert_eq!(last_a.unwrap().data(), Some(&1));
    assert_eq!(last_b.unwrap().data(), Some(&2));
}
