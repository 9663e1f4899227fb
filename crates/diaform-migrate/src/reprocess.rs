//! Offline recomputation of `json_content`.

use tracing::{debug, info};

use crate::content::tokenize;
use crate::error::Result;
use crate::model::ThingKey;
use crate::report::PhaseStats;
use crate::target::TargetStore;

/// Re-tokenizes the content of every stored thing.
///
/// Rows whose stored tokens already match are counted as unchanged and not
/// written; stored values that are not a token array are always rewritten.
/// Runs in its own transaction.
///
/// # Errors
///
/// Returns an error if the target store fails; the pass is rolled back.
pub async fn reprocess_content(target: &mut dyn TargetStore, batch_size: usize) -> Result<PhaseStats> {
    target.begin().await?;
    match reprocess_pages(target, batch_size.max(1)).await {
        Ok(stats) => {
            target.commit().await?;
            info!(
                updated = stats.migrated,
                unchanged = stats.unchanged,
                "Content reprocessing committed"
            );
            Ok(stats)
        }
        Err(e) => {
            target.rollback().await?;
            Err(e)
        }
    }
}

async fn reprocess_pages(target: &mut dyn TargetStore, batch_size: usize) -> Result<PhaseStats> {
    let mut stats = PhaseStats::default();
    let mut after: Option<ThingKey> = None;

    loop {
        let page = target.thing_page(after.as_ref(), batch_size).await?;
        let Some(last) = page.last() else { break };
        after = Some(last.key());

        for thing in &page {
            stats.total += 1;
            let tokens = tokenize(&thing.content);
            if thing.json_content.as_deref() == Some(tokens.as_slice()) {
                stats.unchanged += 1;
                continue;
            }
            if target.set_json_content(&thing.key(), &tokens).await? {
                debug!(user = %thing.user, name = %thing.name, tokens = tokens.len(), "Updated json_content");
                stats.migrated += 1;
            } else {
                stats.skipped += 1;
            }
        }

        if page.len() < batch_size {
            break;
        }
    }
    Ok(stats)
}
