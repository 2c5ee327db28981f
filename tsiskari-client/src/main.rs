mod seed;

use serde_json::json;
use shared::config::SyncConfig;
use shared::{Error, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage_engine::{MemoryBackend, SledKeyValueStore};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tsiskari::SyncContext;
use tsiskari::domain::{Filter, Query};
use tsiskari::events::ChangeEvent;
use tsiskari::planes::control::{CheckerStatus, SubscriptionConfig};
use tsiskari::ports::Backend;

const DEMO_USER: &str = "nino";

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Tsiskari client");

    match dotenvy::dotenv() {
        Ok(_) => info!("Loaded environment variables from .env file"),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let config = SyncConfig::from_env();
    info!(?config, "sync configuration");

    let backend = Arc::new(MemoryBackend::new());
    seed::seed(&backend, DEMO_USER).await?;
    let token = backend.issue_token(DEMO_USER);

    let ctx = SyncContext::new(config.clone(), backend.clone(), backend.clone());

    // moderation gates
    let ban_gate = Arc::new(ctx.ban_gate(DEMO_USER));
    let approval_gate = ctx.approval_gate(DEMO_USER);
    tokio::spawn(log_status("ban", ban_gate.subscribe()));
    tokio::spawn(log_status("approval", approval_gate.subscribe()));
    ban_gate.start();
    approval_gate.start();

    // realtime: feed invalidation, and a re-check whenever our bans change
    let feed = ctx.subscription(ctx.invalidate_on_change("feed-changes", "posts", ["feed"]));
    feed.start().await?;

    let bans = ctx.subscription(
        SubscriptionConfig::new("my-bans", "user_bans", {
            let gate = Arc::clone(&ban_gate);
            move |_: ChangeEvent| gate.poke()
        })
        .filter(Filter::Eq {
            column: "user_id".into(),
            value: json!(DEMO_USER),
        })
        .debounce(config.debounce_window),
    );
    bans.start().await?;

    // below-the-fold data once the first screen is up
    let mut deferred = ctx.deferred();
    deferred.defer(config.defer_delay, {
        let ctx = ctx.clone();
        move |live| async move {
            let stories = ctx
                .query_cached("stories", "story_views", Query::new().eq("viewer_id", DEMO_USER).count_only())
                .await;
            if !live.is_live() {
                return;
            }
            match stories {
                Ok(result) => info!(viewed = result.count, "stories prefetched"),
                Err(e) => warn!(error = %e, "story prefetch failed"),
            }
        }
    });

    let mut activity = tokio::spawn(simulate_activity(ctx.clone(), backend.clone(), token));

    tokio::select! {
        result = &mut activity => {
            match result {
                Ok(Ok(())) => info!("Simulated activity finished, press Ctrl+C to exit"),
                Ok(Err(e)) => error!(error = %e, message = e.user_message().unwrap_or_default(), "Simulated activity failed"),
                Err(e) => error!(error = %e, "Simulated activity task panicked"),
            }
            shutdown_signal().await;
        }
        _ = shutdown_signal() => activity.abort(),
    }

    info!("Tsiskari client shutting down");
    deferred.cancel_all();
    feed.stop().await;
    bans.stop().await;
    ban_gate.stop();
    approval_gate.stop();
    ctx.sign_out();

    Ok(())
}

async fn simulate_activity(ctx: SyncContext, backend: Arc<MemoryBackend>, token: String) -> Result<()> {
    let feed = ctx.query_cached("feed", "posts", Query::new()).await?;
    info!(posts = feed.count, "feed loaded");

    // double tap on the same post
    for _ in 0..2 {
        let outcome = ctx
            .insert_idempotent("post_likes", seed::row(json!({ "post_id": 1, "user_id": DEMO_USER })))
            .await?;
        info!(?outcome, "like recorded");
    }

    backend
        .insert(
            "posts",
            seed::row(json!({ "id": 4, "author_id": DEMO_USER, "title": "გამარჯობა" })),
        )
        .await?;
    sleep(ctx.config().debounce_window + Duration::from_millis(50)).await;
    let feed = ctx.query_cached("feed", "posts", Query::new()).await?;
    info!(posts = feed.count, "feed refreshed after realtime change");

    // a lazily loaded screen failed to load twice in a row
    let store = SledKeyValueStore::open(Path::new(&ctx.config().data_dir).join("client.sled"))?;
    let guard = ctx.reload_guard(Arc::new(store));
    for attempt in 1..=2 {
        let decision = guard.on_load_error(&Error::ModuleLoad("chunk-stories.js".into()))?;
        info!(attempt, ?decision, "module load failure handled");
    }

    if let Err(e) = ctx.privileged().deactivate_account(None).await {
        warn!(message = e.user_message().unwrap_or_default(), "deactivation without a session refused");
    }

    // a moderator bans the user; the realtime poke re-checks right away
    backend
        .insert(
            "user_bans",
            seed::row(json!({ "user_id": DEMO_USER, "is_active": true, "expires_at": null })),
        )
        .await?;
    sleep(Duration::from_secs(1)).await;

    let body = ctx.privileged().deactivate_account(Some(&token)).await?;
    info!(%body, "account deactivated");
    Ok(())
}

async fn log_status(gate: &'static str, mut status: watch::Receiver<CheckerStatus>) {
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        info!(gate, state = ?current.state, gated = current.gated, "gate status changed");
    }
}

// Graceful shutdown handler
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
}
