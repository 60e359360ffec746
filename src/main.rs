use std::sync::Arc;

use anyhow::Context;

use admin_tasks::api::{AppState, task_routes};
use admin_tasks::audit::TracingAudit;
use admin_tasks::auth::StaticPrincipals;
use admin_tasks::config::ServiceConfig;
use admin_tasks::tasks::{Reclaimer, TaskRunner, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("reading configuration")?;

    // Initialize tracing; the guard must live until exit to flush file logs
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "admin-tasks.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    eprintln!("🛠  Admin Tasks v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Listening: http://{}", config.addr());
    eprintln!("   Reclaim grace: {}s", config.reclaim_grace.as_secs());

    // ── Principals ───────────────────────────────────────────────────────
    let principals = match &config.principals_path {
        Some(path) => StaticPrincipals::load(path)
            .with_context(|| format!("loading principals from {}", path.display()))?,
        None => {
            eprintln!("   Warning: ADMIN_TASKS_PRINCIPALS not set, every request will be rejected");
            StaticPrincipals::new()
        }
    };
    eprintln!("   Principals: {}", principals.len());

    // ── Executors ────────────────────────────────────────────────────────
    let executors = config.executors();
    let kinds: Vec<&str> = executors.kinds().iter().map(|k| k.as_str()).collect();
    eprintln!(
        "   Executors: {}",
        if kinds.is_empty() {
            "none".to_string()
        } else {
            kinds.join(", ")
        }
    );

    // ── Task engine ──────────────────────────────────────────────────────
    let store = TaskStore::new();
    let reclaimer = Reclaimer::spawn(&store, config.reclaim_grace);
    let runner = Arc::new(TaskRunner::new(
        store,
        executors,
        Arc::new(TracingAudit),
        reclaimer,
    ));

    let app = task_routes(AppState::new(runner, Arc::new(principals)));

    let listener = tokio::net::TcpListener::bind(config.addr())
        .await
        .with_context(|| format!("binding {}", config.addr()))?;
    tracing::info!(addr = %config.addr(), "Task server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
