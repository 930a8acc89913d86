//! Subcommand implementations

use std::error::Error;
use std::time::Duration;

use serde::Serialize;
use tabsync_core::{ChannelNaming, Context, SyncConfig};

type CmdResult<T = ()> = Result<T, Box<dyn Error>>;

pub fn add(config: &SyncConfig, name: Option<String>) -> CmdResult {
    let ctx = Context::open(config)?;
    let name = match name {
        Some(name) => name,
        None => format!("Item {}", ctx.direct_count()? + 1),
    };
    let item = ctx.add_item(name)?;
    println!("{}\t{}\t{}", item.id, item.name, item.tab_id);
    Ok(())
}

pub fn query(config: &SyncConfig) -> CmdResult {
    let ctx = Context::open(config)?;
    let items = ctx.direct_items()?;
    for item in &items {
        println!(
            "{}\t{}\t{}\t{}",
            item.id,
            item.name,
            item.created_at_text(),
            item.tab_id
        );
    }
    println!("count: {}", items.len());
    Ok(())
}

pub async fn watch(config: &SyncConfig, seconds: Option<u64>) -> CmdResult {
    watch_until(config, seconds, tokio::signal::ctrl_c()).await
}

/// Pump a live view until `seconds` elapse or `shutdown` completes.
async fn watch_until<S>(config: &SyncConfig, seconds: Option<u64>, shutdown: S) -> CmdResult
where
    S: std::future::Future,
{
    let ctx = Context::open(config)?;
    let view = ctx.watch_items()?;
    let updates = view.listen();
    tracing::info!(
        tab = ctx.tab_id(),
        naming = %ctx.naming(),
        items = view.len(),
        "Watching items"
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(config.bus.poll_interval_ms));
    let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
    let mut reported_divergence = false;
    // One future for the whole loop; a signal during pump must not be lost
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut shutdown => break,
        }
        if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
            break;
        }

        ctx.pump()?;
        while let Ok(rows) = updates.try_recv() {
            tracing::info!("collection updated: {} items", rows.len());
        }

        let divergence = ctx.diagnose(&view)?;
        if divergence.is_diverged() && !reported_divergence {
            println!(
                "Bug detected! view shows {} items, store holds {}",
                divergence.view_count, divergence.direct_count
            );
        }
        reported_divergence = divergence.is_diverged();
    }

    ctx.dispose(view.as_ref())?;
    Ok(())
}

/// Counts seen by one context at the end of a repro run
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextCounts {
    pub tab_id: String,
    pub view_count: usize,
    pub direct_count: usize,
}

#[derive(Debug, Serialize)]
pub struct ReproReport {
    pub naming: ChannelNaming,
    pub contexts: Vec<ContextCounts>,
    pub diverged: bool,
}

impl ReproReport {
    pub fn print(&self) {
        println!("naming: {}", self.naming);
        for c in &self.contexts {
            println!(
                "tab {}: viewCount={} directCount={}",
                c.tab_id, c.view_count, c.direct_count
            );
        }
        if self.diverged {
            println!("Bug detected! a live view disagrees with the store");
        } else {
            println!("Views agree with the store");
        }
    }
}

/// Two contexts on one store: A writes, both pump, both compare.
///
/// Uses a throwaway store unless the caller pinned one with `--db`.
pub fn repro(config: &SyncConfig, keep_store: bool) -> CmdResult<ReproReport> {
    let scratch = if keep_store {
        None
    } else {
        Some(tempfile::tempdir()?)
    };
    let mut base = config.clone();
    if let Some(dir) = &scratch {
        base.store.path = dir.path().join(tabsync_core::config::DEFAULT_DB_FILENAME);
    }

    let open = |tab: &str| -> tabsync_core::Result<Context> {
        let mut config = base.clone();
        config.tab_id = Some(tab.to_string());
        Context::open(&config)
    };
    let a = open("A")?;
    let b = open("B")?;
    let view_a = a.watch_items()?;
    let view_b = b.watch_items()?;

    let name = format!("Item {}", a.direct_count()? + 1);
    a.add_item(name)?;
    a.pump()?;
    b.pump()?;

    let mut contexts = Vec::new();
    let mut diverged = false;
    for (ctx, view) in [(&a, &view_a), (&b, &view_b)] {
        let divergence = ctx.diagnose(view)?;
        diverged |= divergence.is_diverged();
        contexts.push(ContextCounts {
            tab_id: ctx.tab_id().to_string(),
            view_count: divergence.view_count,
            direct_count: divergence.direct_count,
        });
    }

    Ok(ReproReport {
        naming: base.bus.naming,
        contexts,
        diverged,
    })
}

pub fn prune(config: &SyncConfig) -> CmdResult {
    let ctx = Context::open(config)?;
    let removed = ctx.prune_journal(config.bus.journal_retention)?;
    println!("removed {} journal entries", removed);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(naming: ChannelNaming) -> SyncConfig {
        let mut config = SyncConfig::new();
        config.bus.naming = naming;
        config
    }

    #[test]
    fn repro_converges_with_schema_labels() {
        let report = repro(&config(ChannelNaming::SchemaDerived), false).unwrap();
        assert!(!report.diverged);
        assert!(report
            .contexts
            .iter()
            .all(|c| c.view_count == 1 && c.direct_count == 1));
    }

    #[test]
    fn repro_diverges_with_session_labels() {
        let report = repro(&config(ChannelNaming::SessionRandom), false).unwrap();
        assert!(report.diverged);
        let b = &report.contexts[1];
        assert_eq!(b.tab_id, "B");
        assert_eq!((b.view_count, b.direct_count), (0, 1));
    }

    #[tokio::test]
    async fn watch_stops_on_shutdown_spanning_several_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SyncConfig::for_path(dir.path().join("watch.db"));
        config.bus.poll_interval_ms = 20;

        // Outlives many ticks, so it only fires if the loop keeps one future
        let shutdown = tokio::time::sleep(Duration::from_millis(200));
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            watch_until(&config, None, shutdown),
        )
        .await;
        assert!(result.expect("watch did not stop").is_ok());
    }

    #[test]
    fn repro_on_pinned_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig::for_path(dir.path().join("pinned.db"));
        repro(&config, true).unwrap();
        let report = repro(&config, true).unwrap();
        assert!(report.contexts.iter().all(|c| c.direct_count == 2));
    }
}
