//! State projection, diff, and patch pipeline over an in-memory pipe:
//! full SET on attach, minimal patches, empty-diff silence, forced
//! resync, inbound SET/PATCH application, and naming transforms.

use serde::{Deserialize, Serialize};
use serde_json::json;
use statesync::{param, Session, SyncHandle, TypeDesc, UnitBuilder};
use std::time::Duration;
use sync_test_utils::{pipe, TestPeer};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Notes {
    title: String,
    notes: Vec<String>,
}

fn notes_builder() -> UnitBuilder<Notes> {
    UnitBuilder::<Notes>::sync_all("NOTES")
        .typed("title", TypeDesc::Str)
        .typed("notes", TypeDesc::List(Box::new(TypeDesc::Str)))
        .action("rename", vec![param("title", TypeDesc::Str)], |h, args| {
            async move {
                h.write().title = args.get("title")?;
                h.sync()
            }
        })
        .action("add", vec![param("note", TypeDesc::Str)], |h, args| {
            async move {
                h.write().notes.push(args.get("note")?);
                h.sync()
            }
        })
        .action("touch", vec![], |h, _| async move { h.sync() })
}

/// Register, attach, and drive a session in the background.
fn start(notes: Notes) -> (Session, TestPeer, SyncHandle<Notes>) {
    let session = Session::new();
    let handle = notes_builder().register(notes, &session).unwrap();
    let (transport, peer) = pipe();
    session.attach(transport);
    let runner = session.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    (session, peer, handle)
}

#[tokio::test]
async fn attach_sends_full_set_with_complete_state() {
    let (_session, mut peer, _handle) = start(Notes {
        title: "N".to_owned(),
        notes: Vec::new(),
    });
    let set = peer.expect("NOTES:SET").await;
    assert_eq!(set.data, json!({"title": "N", "notes": []}));
}

#[tokio::test]
async fn units_resync_in_registration_order() {
    #[derive(Serialize, Deserialize, Default)]
    struct Counter {
        value: i64,
    }

    let session = Session::new();
    notes_builder().register(Notes::default(), &session).unwrap();
    UnitBuilder::<Counter>::sync_all("COUNTER")
        .register(Counter::default(), &session)
        .unwrap();

    let (transport, mut peer) = pipe();
    session.attach(transport);
    let runner = session.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    peer.expect("NOTES:SET").await;
    peer.expect("COUNTER:SET").await;
}

#[tokio::test]
async fn append_to_list_emits_a_single_add_op() {
    let (_session, mut peer, _handle) = start(Notes {
        title: "N".to_owned(),
        notes: Vec::new(),
    });
    peer.expect("NOTES:SET").await;

    peer.send_event("NOTES:ACTION:ADD", json!({"note": "hello"}));
    let patch = peer.expect("NOTES:PATCH").await;
    let ops = patch.data.as_array().expect("patch is an array");
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["op"], "add");
    let path = ops[0]["path"].as_str().unwrap();
    assert!(
        path == "/notes/0" || path == "/notes/-",
        "unexpected path {path}"
    );
    assert_eq!(ops[0]["value"], "hello");
}

#[tokio::test]
async fn unchanged_projection_emits_nothing() {
    let (_session, mut peer, _handle) = start(Notes::default());
    peer.expect("NOTES:SET").await;

    peer.send_event("NOTES:ACTION:TOUCH", json!({}));
    assert!(peer.silent(Duration::from_millis(150)).await);
}

#[tokio::test]
async fn get_forces_a_full_resync() {
    let (_session, mut peer, _handle) = start(Notes {
        title: "N".to_owned(),
        notes: vec!["a".to_owned()],
    });
    peer.expect("NOTES:SET").await;

    peer.send_event("NOTES:GET", json!(null));
    let set = peer.expect("NOTES:SET").await;
    assert_eq!(set.data, json!({"title": "N", "notes": ["a"]}));
}

#[tokio::test]
async fn inbound_set_round_trips_through_get() {
    let (_session, mut peer, handle) = start(Notes::default());
    peer.expect("NOTES:SET").await;

    let replacement = json!({"title": "T", "notes": ["a", "b"]});
    peer.send_event("NOTES:SET", replacement.clone());
    peer.send_event("NOTES:GET", json!(null));

    let set = peer.expect("NOTES:SET").await;
    assert_eq!(set.data, replacement);
    assert_eq!(handle.read().title, "T");
    assert_eq!(handle.read().notes, vec!["a", "b"]);
}

#[tokio::test]
async fn inbound_set_with_wrong_type_is_rejected() {
    let (_session, mut peer, handle) = start(Notes {
        title: "N".to_owned(),
        notes: Vec::new(),
    });
    peer.expect("NOTES:SET").await;

    peer.send_event("NOTES:SET", json!({"title": 7, "notes": []}));
    let error = peer.expect("NOTES:ERROR").await;
    assert_eq!(error.data["path"], "/title");
    assert_eq!(handle.read().title, "N");
}

#[tokio::test]
async fn inbound_patch_applies_and_validates() {
    let (_session, mut peer, handle) = start(Notes {
        title: "N".to_owned(),
        notes: Vec::new(),
    });
    peer.expect("NOTES:SET").await;

    peer.send_event(
        "NOTES:PATCH",
        json!([{"op": "replace", "path": "/title", "value": "X"}]),
    );
    peer.send_event("NOTES:GET", json!(null));
    let set = peer.expect("NOTES:SET").await;
    assert_eq!(set.data["title"], "X");

    // Ill-typed patch result: rejected, owner untouched.
    peer.send_event(
        "NOTES:PATCH",
        json!([{"op": "replace", "path": "/title", "value": 5}]),
    );
    let error = peer.expect("NOTES:ERROR").await;
    assert_eq!(error.data["path"], "/title");
    assert_eq!(handle.read().title, "X");
}

#[tokio::test]
async fn patches_replay_to_the_served_document() {
    let (_session, mut peer, _handle) = start(Notes::default());
    let mut doc = peer.expect("NOTES:SET").await.data;

    for (event, data) in [
        ("NOTES:ACTION:RENAME", json!({"title": "plans"})),
        ("NOTES:ACTION:ADD", json!({"note": "one"})),
        ("NOTES:ACTION:ADD", json!({"note": "two"})),
        ("NOTES:ACTION:RENAME", json!({"title": "final"})),
    ] {
        peer.send_event(event, data);
        let patch = peer.expect("NOTES:PATCH").await;
        let parsed: json_patch::Patch = serde_json::from_value(patch.data).unwrap();
        json_patch::patch(&mut doc, &parsed).unwrap();
    }

    peer.send_event("NOTES:GET", json!(null));
    let served = peer.expect("NOTES:SET").await.data;
    assert_eq!(doc, served, "patched document diverged from server state");
}

#[tokio::test]
async fn camel_case_transform_applies_both_directions() {
    #[derive(Serialize, Deserialize, Default)]
    struct Person {
        first_name: String,
    }

    let session = Session::new();
    let handle = UnitBuilder::<Person>::sync_all("PEOPLE")
        .camel_case()
        .typed("first_name", TypeDesc::Str)
        .register(
            Person {
                first_name: "Ada".to_owned(),
            },
            &session,
        )
        .unwrap();

    let (transport, mut peer) = pipe();
    session.attach(transport);
    let runner = session.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    let set = peer.expect("PEOPLE:SET").await;
    assert_eq!(set.data, json!({"firstName": "Ada"}));

    peer.send_event("PEOPLE:SET", json!({"firstName": "Grace"}));
    peer.send_event("PEOPLE:GET", json!(null));
    assert_eq!(
        peer.expect("PEOPLE:SET").await.data,
        json!({"firstName": "Grace"})
    );
    assert_eq!(handle.read().first_name, "Grace");
}

#[tokio::test]
async fn camel_case_applies_to_action_and_task_names() {
    #[derive(Serialize, Deserialize, Default)]
    struct Profile {
        display_name: String,
        tags: Vec<String>,
    }

    let session = Session::new();
    UnitBuilder::<Profile>::sync_all("PROFILE")
        .camel_case()
        .action("add_tag", vec![param("tag", TypeDesc::Str)], |h, args| {
            async move {
                h.write().tags.push(args.get("tag")?);
                h.sync()
            }
        })
        .task("fill_tags", vec![], |h, _, _| async move {
            h.write().tags.push("filled".to_owned());
            h.sync()
        })
        .register(Profile::default(), &session)
        .unwrap();

    let (transport, mut peer) = pipe();
    session.attach(transport);
    let runner = session.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    let set = peer.expect("PROFILE:SET").await;
    assert_eq!(set.data, json!({"displayName": "", "tags": []}));

    // The upper-snake spelling is not registered under the transform.
    peer.send_event("PROFILE:ACTION:ADD_TAG", json!({"tag": "x"}));
    assert!(peer.silent(Duration::from_millis(150)).await);

    peer.send_event("PROFILE:ACTION:addTag", json!({"tag": "x"}));
    let patch = peer.expect("PROFILE:PATCH").await;
    assert_eq!(patch.data[0]["op"], "add");
    assert_eq!(patch.data[0]["path"], "/tags/0");

    // Failure envelopes answer under the transformed name too.
    peer.send_event("PROFILE:ACTION:addTag", json!({"tag": 1}));
    let error = peer.expect("PROFILE:ERROR:addTag").await;
    assert_eq!(error.data["path"], "/tag");

    // Task start and completion both use the transformed name.
    peer.send_event("PROFILE:TASK_START:fillTags", json!(null));
    peer.expect("PROFILE:PATCH").await;
    peer.expect("PROFILE:TASK_DONE:fillTags").await;
}

#[tokio::test]
async fn renamed_and_underscored_attributes_project_as_declared() {
    #[derive(Serialize, Deserialize, Default)]
    struct Doc {
        body: String,
        _draft: bool,
    }

    let session = Session::new();
    UnitBuilder::<Doc>::sync_all("DOC")
        .rename("body", "content")
        .register(
            Doc {
                body: "text".to_owned(),
                _draft: true,
            },
            &session,
        )
        .unwrap();

    let (transport, mut peer) = pipe();
    session.attach(transport);
    let runner = session.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });

    let set = peer.expect("DOC:SET").await;
    assert_eq!(set.data, json!({"content": "text"}));
}

#[tokio::test]
async fn unknown_events_are_discarded_without_killing_the_session() {
    let (_session, mut peer, _handle) = start(Notes::default());
    peer.expect("NOTES:SET").await;

    peer.send_text("{not json");
    peer.send_event("NOTES:NONSENSE", json!(1));
    peer.send_event("OTHER:GET", json!(null));

    peer.send_event("NOTES:GET", json!(null));
    peer.expect("NOTES:SET").await;
}

#[tokio::test]
async fn failed_projection_leaves_snapshot_unchanged() {
    #[derive(Serialize, Deserialize, Default)]
    struct Weird {
        broken: bool,
        n: i64,
    }

    let session = Session::new();
    UnitBuilder::<Weird>::manual(
        "WEIRD",
        |s| {
            if s.broken {
                Err(statesync::ProjectionError::NotAnObject)
            } else {
                Ok(json!({"n": s.n}))
            }
        },
        |_s, _doc| Ok(()),
    )
    .action("explode", vec![], |h, _| async move {
        h.write().broken = true;
        let _ = h.sync();
        Ok(())
    })
    .action("fix", vec![], |h, _| async move {
        {
            let mut s = h.write();
            s.broken = false;
            s.n += 1;
        }
        h.sync()
    })
    .register(Weird::default(), &session)
    .unwrap();

    let (transport, mut peer) = pipe();
    session.attach(transport);
    let runner = session.clone();
    tokio::spawn(async move {
        let _ = runner.run().await;
    });
    peer.expect("WEIRD:SET").await;

    peer.send_event("WEIRD:ACTION:EXPLODE", json!({}));
    peer.expect("WEIRD:ERROR").await;

    // The failed sync must not have advanced the snapshot: the next
    // successful sync diffs against the pre-failure document.
    peer.send_event("WEIRD:ACTION:FIX", json!({}));
    let patch = peer.expect("WEIRD:PATCH").await;
    let ops = patch.data.as_array().unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0]["path"], "/n");
    assert_eq!(ops[0]["value"], 1);
}
