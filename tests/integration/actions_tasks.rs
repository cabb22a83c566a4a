//! Action sequencing, argument validation, and the task lifecycle:
//! concurrent bodies, cooperative and default cancellation, duplicate
//! start rejection, and completion envelopes.

use serde::{Deserialize, Serialize};
use serde_json::json;
use statesync::{param, Session, SyncHandle, TaskOutcome, TypeDesc, UnitBuilder};
use std::time::Duration;
use sync_test_utils::{pipe, TestPeer};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
    title: String,
    value: i64,
}

fn counter_builder() -> UnitBuilder<Counter> {
    UnitBuilder::<Counter>::sync_all("COUNTER")
        .typed("title", TypeDesc::Str)
        .typed("value", TypeDesc::Int)
        .action("rename", vec![param("title", TypeDesc::Str)], |h, args| {
            async move {
                h.write().title = args.get("title")?;
                h.sync()
            }
        })
        .action("slow_rename", vec![param("title", TypeDesc::Str)], |h, args| {
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                h.write().title = args.get("title")?;
                h.sync()
            }
        })
        .action("fail", vec![], |_h, _| async move {
            Err(statesync::SyncError::handler("deliberate failure"))
        })
        .blocking_action("bump_blocking", vec![param("by", TypeDesc::Int)], |h, args| {
            h.write().value += args.get::<i64>("by")?;
            h.sync()
        })
        .task("inc", vec![param("by", TypeDesc::Int)], |h, args, ctx| {
            async move {
                let by: i64 = args.get("by")?;
                for _ in 0..by {
                    if ctx.is_cancelled() {
                        break;
                    }
                    h.write().value += 1;
                    h.sync()?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(())
            }
        })
        .task("quick_mark", vec![], |h, _, _| async move {
            h.write().title = "marked".to_owned();
            h.sync()
        })
}

fn start() -> (Session, TestPeer, SyncHandle<Counter>) {
    let session = Session::new();
    let handle = counter_builder()
        .register(Counter::default(), &session)
        .unwrap();
    let (transport, peer) = pipe();
    session.attach(transport);
    let runner = session.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (session, peer, handle)
}

fn title_patch_value(patch: &statesync::Envelope) -> String {
    let ops = patch.data.as_array().expect("patch array");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["path"], "/title");
    ops[0]["value"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn back_to_back_actions_apply_in_submission_order() {
    let (_session, mut peer, _handle) = start();
    peer.expect("COUNTER:SET").await;

    peer.send_event("COUNTER:ACTION:SLOW_RENAME", json!({"title": "A"}));
    peer.send_event("COUNTER:ACTION:RENAME", json!({"title": "B"}));

    let first = peer.expect("COUNTER:PATCH").await;
    let second = peer.expect("COUNTER:PATCH").await;
    assert_eq!(title_patch_value(&first), "A");
    assert_eq!(title_patch_value(&second), "B");
}

#[tokio::test]
async fn ill_typed_action_argument_is_rejected_without_side_effects() {
    let (_session, mut peer, handle) = start();
    peer.expect("COUNTER:SET").await;

    peer.send_event("COUNTER:ACTION:RENAME", json!({"title": 123}));
    let error = peer.expect("COUNTER:ERROR:RENAME").await;
    assert_eq!(error.data["path"], "/title");
    assert_eq!(handle.read().title, "");
    assert!(peer.silent(Duration::from_millis(150)).await, "no patch may follow");
}

#[tokio::test]
async fn handler_failure_reports_and_session_continues() {
    let (_session, mut peer, _handle) = start();
    peer.expect("COUNTER:SET").await;

    peer.send_event("COUNTER:ACTION:FAIL", json!({}));
    let error = peer.expect("COUNTER:ERROR:FAIL").await;
    assert_eq!(error.data["message"], "deliberate failure");

    peer.send_event("COUNTER:ACTION:RENAME", json!({"title": "still alive"}));
    peer.expect("COUNTER:PATCH").await;
}

#[tokio::test]
async fn blocking_actions_run_on_the_worker_pool() {
    let (_session, mut peer, handle) = start();
    peer.expect("COUNTER:SET").await;

    peer.send_event("COUNTER:ACTION:BUMP_BLOCKING", json!({"by": 5}));
    let patch = peer.expect("COUNTER:PATCH").await;
    assert_eq!(patch.data[0]["path"], "/value");
    assert_eq!(patch.data[0]["value"], 5);
    assert_eq!(handle.read().value, 5);
}

#[tokio::test]
async fn task_runs_to_completion_and_reports_done() {
    let (_session, mut peer, _handle) = start();
    peer.expect("COUNTER:SET").await;

    peer.send_event("COUNTER:TASK_START:INC", json!({"by": 3}));
    for _ in 0..3 {
        peer.expect("COUNTER:PATCH").await;
    }
    let done = peer.expect("COUNTER:TASK_DONE:INC").await;
    let done: statesync::TaskDone = serde_json::from_value(done.data).unwrap();
    assert_eq!(done.outcome, TaskOutcome::Completed);
}

#[tokio::test]
async fn task_cancel_stops_a_long_run() {
    let (_session, mut peer, _handle) = start();
    peer.expect("COUNTER:SET").await;

    peer.send_event("COUNTER:TASK_START:INC", json!({"by": 1_000_000}));
    for _ in 0..3 {
        peer.expect("COUNTER:PATCH").await;
    }
    peer.send_event("COUNTER:TASK_CANCEL:INC", json!(null));

    // A few in-flight patches may still arrive, then the completion.
    let mut trailing = 0;
    loop {
        let envelope = peer.recv().await;
        match envelope.event.as_str() {
            "COUNTER:PATCH" => {
                trailing += 1;
                assert!(trailing < 100, "cancel did not stop the task");
            }
            "COUNTER:TASK_DONE:INC" => {
                let done: statesync::TaskDone = serde_json::from_value(envelope.data).unwrap();
                assert_eq!(done.outcome, TaskOutcome::Cancelled);
                break;
            }
            other => panic!("unexpected event {other}"),
        }
    }
}

#[tokio::test]
async fn cancel_hook_runs_instead_of_abort() {
    #[derive(Serialize, Deserialize, Default)]
    struct Job {
        progress: i64,
        stop_requested: bool,
    }

    let session = Session::new();
    UnitBuilder::<Job>::sync_all("JOB")
        .task("grind", vec![], |h, _, _| async move {
            loop {
                if h.read().stop_requested {
                    break;
                }
                h.write().progress += 1;
                h.sync()?;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(())
        })
        .on_cancel("grind", |h| async move {
            h.write().stop_requested = true;
            Ok(())
        })
        .register(Job::default(), &session)
        .unwrap();

    let (transport, mut peer) = pipe();
    session.attach(transport);
    let runner = session.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    peer.expect("JOB:SET").await;

    peer.send_event("JOB:TASK_START:GRIND", json!(null));
    peer.expect("JOB:PATCH").await;
    peer.send_event("JOB:TASK_CANCEL:GRIND", json!(null));

    loop {
        let envelope = peer.recv().await;
        if envelope.event == "JOB:TASK_DONE:GRIND" {
            let done: statesync::TaskDone = serde_json::from_value(envelope.data).unwrap();
            // The hook asked the body to stop; the body returned on its
            // own, which still classifies as cancelled.
            assert_eq!(done.outcome, TaskOutcome::Cancelled);
            break;
        }
        assert!(
            envelope.event == "JOB:PATCH",
            "unexpected event {}",
            envelope.event
        );
    }
}

#[tokio::test]
async fn duplicate_task_start_is_rejected() {
    let (_session, mut peer, _handle) = start();
    peer.expect("COUNTER:SET").await;

    peer.send_event("COUNTER:TASK_START:INC", json!({"by": 1_000_000}));
    peer.expect("COUNTER:PATCH").await;
    peer.send_event("COUNTER:TASK_START:INC", json!({"by": 1_000_000}));
    peer.send_event("COUNTER:TASK_CANCEL:INC", json!(null));

    let mut completions = 0;
    while let Some(envelope) = peer.next_within(Duration::from_millis(300)).await {
        match envelope.event.as_str() {
            "COUNTER:PATCH" => {}
            "COUNTER:TASK_DONE:INC" => completions += 1,
            other => panic!("unexpected event {other}"),
        }
    }
    assert_eq!(completions, 1, "the duplicate start must not spawn a second task");
}

#[tokio::test]
async fn ill_typed_task_argument_is_rejected() {
    let (_session, mut peer, _handle) = start();
    peer.expect("COUNTER:SET").await;

    peer.send_event("COUNTER:TASK_START:INC", json!({"by": "many"}));
    let error = peer.expect("COUNTER:ERROR:INC").await;
    assert_eq!(error.data["path"], "/by");
    assert!(peer.silent(Duration::from_millis(150)).await);
}

#[tokio::test]
async fn tasks_started_behind_an_action_wait_for_it() {
    let (_session, mut peer, _handle) = start();
    peer.expect("COUNTER:SET").await;

    peer.send_event("COUNTER:ACTION:SLOW_RENAME", json!({"title": "first"}));
    peer.send_event("COUNTER:TASK_START:QUICK_MARK", json!(null));

    let first = peer.expect("COUNTER:PATCH").await;
    assert_eq!(title_patch_value(&first), "first");
    let second = peer.expect("COUNTER:PATCH").await;
    assert_eq!(title_patch_value(&second), "marked");
    let done = peer.expect("COUNTER:TASK_DONE:QUICK_MARK").await;
    let done: statesync::TaskDone = serde_json::from_value(done.data).unwrap();
    assert_eq!(done.outcome, TaskOutcome::Completed);
}
