//! Service event feed.
//!
//! Tails the orchestrator's service event stream and forwards each change to
//! the worker. The cursor is persisted after every page so a restart resumes
//! where it left off; replayed events are harmless since every pass is
//! idempotent.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use vlb_id::ServiceKey;

use crate::orchestrator::{EventItem, OrchestratorClient};
use crate::service::{ServiceEvent, ServiceSpec};

/// Feed polling settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub poll_interval: Duration,
    pub fetch_limit: i64,
    pub cursor_file: Option<PathBuf>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            fetch_limit: 100,
            cursor_file: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeletedPayload {
    namespace: String,
    name: String,
}

/// Translate a feed item into a worker event. Unrelated event types yield
/// `None`.
pub fn decode_event(item: &EventItem) -> Result<Option<ServiceEvent>> {
    let event = match item.event_type.as_str() {
        "service.upserted" | "service.deleted" => {
            let payload = item
                .payload
                .clone()
                .with_context(|| format!("{} event {} missing payload", item.event_type, item.event_id))?;

            if item.event_type == "service.upserted" {
                let spec: ServiceSpec = serde_json::from_value(payload)
                    .context("invalid service.upserted payload JSON")?;
                ServiceEvent::Upserted(spec)
            } else {
                let payload: DeletedPayload = serde_json::from_value(payload)
                    .context("invalid service.deleted payload JSON")?;
                ServiceEvent::Deleted(ServiceKey::new(payload.namespace, payload.name)?)
            }
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

/// Load the persisted cursor. A missing or blank file starts from zero.
async fn read_cursor(path: &Path) -> Result<i64> {
    let raw = match fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read cursor {}", path.display()))
        }
    };

    match raw.trim() {
        "" => Ok(0),
        value => value
            .parse()
            .with_context(|| format!("Cursor {} holds {value:?}", path.display())),
    }
}

async fn write_cursor(path: &Path, cursor: i64) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let staged = path.with_extension("tmp");
    fs::write(&staged, cursor.to_string())
        .await
        .with_context(|| format!("Failed to stage cursor {}", staged.display()))?;
    fs::rename(&staged, path)
        .await
        .with_context(|| format!("Failed to commit cursor {}", path.display()))?;

    debug!(cursor, "cursor saved");
    Ok(())
}

/// Poll the event feed until shutdown, forwarding service changes to
/// `events`.
pub async fn run_event_feed(
    config: FeedConfig,
    client: Arc<OrchestratorClient>,
    events: mpsc::Sender<ServiceEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut cursor = match &config.cursor_file {
        Some(path) => read_cursor(path).await?,
        None => 0,
    };
    info!(cursor, "Starting service event feed");

    loop {
        if *shutdown.borrow() {
            info!(cursor, "Event feed shutting down");
            return Ok(());
        }

        let page = match client.fetch_events(cursor, config.fetch_limit).await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, cursor, "failed to fetch events; retrying");
                if wait_or_shutdown(&mut shutdown, config.poll_interval).await {
                    return Ok(());
                }
                continue;
            }
        };

        if page.items.is_empty() {
            if wait_or_shutdown(&mut shutdown, config.poll_interval).await {
                return Ok(());
            }
            continue;
        }

        for item in &page.items {
            cursor = item.event_id;

            match decode_event(item) {
                Ok(Some(event)) => {
                    debug!(event_id = item.event_id, service = %event.key(), "forwarding service event");
                    if events.send(event).await.is_err() {
                        info!("Worker channel closed; stopping event feed");
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(event_id = item.event_id, event_type = %item.event_type, error = %e, "skipping undecodable event");
                }
            }
        }

        cursor = page.next_after_event_id.max(cursor);

        if let Some(path) = &config.cursor_file {
            write_cursor(path, cursor).await?;
        }
    }
}

/// Sleep for `delay`. Returns `true` if shutdown was requested meanwhile.
async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
