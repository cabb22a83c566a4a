// demo: a minimal notes server showing the sync engine end to end.
//
// One session per WebSocket connection.  The `NOTES` unit exposes a
// title and a list of notes; the client can rename, append, and run a
// cancellable countdown task that ticks the title.
//
// Connect with any WS client and try:
//   {"type":"NOTES:ACTION:RENAME","data":{"title":"groceries"}}
//   {"type":"NOTES:ACTION:ADD","data":{"note":"milk"}}
//   {"type":"NOTES:TASK_START:COUNTDOWN","data":{"from":10}}
//   {"type":"NOTES:TASK_CANCEL:COUNTDOWN"}

use axum::{extract::WebSocketUpgrade, response::IntoResponse, routing::get, Router};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sync_session::{param, RegisterError, Session, SyncHandle, TypeDesc, UnitBuilder};
use tracing::{error, info};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Notes {
    title: String,
    notes: Vec<String>,
}

fn register_notes(session: &Session) -> Result<SyncHandle<Notes>, RegisterError> {
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
        .task(
            "countdown",
            vec![param("from", TypeDesc::Int)],
            |h, args, ctx| async move {
                let mut remaining: i64 = args.get("from")?;
                while remaining > 0 && !ctx.is_cancelled() {
                    remaining -= 1;
                    h.write().title = format!("T-minus {remaining}");
                    h.sync()?;
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Ok(())
            },
        )
        .register(
            Notes {
                title: "Untitled".to_owned(),
                notes: Vec::new(),
            },
            session,
        )
}

async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|socket| async move {
        let session = Session::new();
        match register_notes(&session) {
            Ok(_) => {
                sync_axum::serve(&session, socket).await;
                session.close();
            }
            Err(e) => error!(error = %e, "failed to register notes unit"),
        }
    })
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let bind = std::env::var("DEMO_BIND").unwrap_or_else(|_| "127.0.0.1:8000".to_owned());
    info!(version = env!("CARGO_PKG_VERSION"), bind = %bind, "demo starting");

    let app = Router::new().route("/ws", get(ws_handler));
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: failed to bind {bind}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        eprintln!("FATAL: server error: {e}");
        std::process::exit(1);
    }
}
