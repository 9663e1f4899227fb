//! Best-effort `first_created` backfill.
//!
//! Thing names created by the application encode their creation time: the
//! name read as a base-36 number, divided by 36², is a Unix timestamp in
//! seconds. Names outside a plausible range were not generated that way and
//! are left alone. The result is advisory and runs in its own transaction
//! after the migration has committed.

use std::num::IntErrorKind;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::Result;
use crate::model::ThingKey;
use crate::report::{IntegrityWarning, PhaseStats, WarningKind};
use crate::target::TargetStore;

/// Earliest accepted timestamp, in seconds.
pub const MIN_CREATION_SECS: u128 = 1_000;
/// Latest accepted timestamp, in seconds.
pub const MAX_CREATION_SECS: u128 = 2_000_000_000;

const SUFFIX_DIVISOR: u128 = 36 * 36;

/// Decoded creation time of a thing name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationTime {
    /// The name encodes this time.
    At(DateTime<Utc>),
    /// Base-36, but not a timestamp-style name.
    OutOfRange,
    /// Not a base-36 number.
    Unparseable,
}

/// Decodes the creation time embedded in a thing name.
///
/// Accepts the integer literal syntax names were generated against:
/// surrounding whitespace, one leading sign and single `_` separators
/// between digits. Negative numbers parse but are out of range.
pub fn decode_creation_time(name: &str) -> CreationTime {
    let trimmed = name.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    if digits.starts_with(['+', '-', '_']) || digits.ends_with('_') || digits.contains("__") {
        return CreationTime::Unparseable;
    }
    let value = match u128::from_str_radix(&digits.replace('_', ""), 36) {
        Ok(value) => value,
        Err(e) if *e.kind() == IntErrorKind::PosOverflow => return CreationTime::OutOfRange,
        Err(_) => return CreationTime::Unparseable,
    };
    if negative {
        return CreationTime::OutOfRange;
    }
    let secs = value / SUFFIX_DIVISOR;
    if !(MIN_CREATION_SECS..=MAX_CREATION_SECS).contains(&secs) {
        return CreationTime::OutOfRange;
    }
    // Bounded above, so the cast cannot truncate.
    match DateTime::from_timestamp(secs as i64, 0) {
        Some(at) => CreationTime::At(at),
        None => CreationTime::OutOfRange,
    }
}

/// Result of a backfill pass.
#[derive(Debug, Default, Clone)]
pub struct BackfillOutcome {
    /// `total` things scanned, `migrated` set, `unchanged` already set,
    /// `skipped` without a decodable time.
    pub stats: PhaseStats,
    pub warnings: Vec<IntegrityWarning>,
}

/// Sets `first_created` on every thing that has none and a decodable name.
///
/// # Errors
///
/// Returns an error if the target store fails; the pass is rolled back.
pub async fn backfill_first_created(
    target: &mut dyn TargetStore,
    batch_size: usize,
) -> Result<BackfillOutcome> {
    target.begin().await?;
    match backfill_pages(target, batch_size.max(1)).await {
        Ok(outcome) => {
            target.commit().await?;
            info!(
                updated = outcome.stats.migrated,
                scanned = outcome.stats.total,
                "first_created backfill committed"
            );
            Ok(outcome)
        }
        Err(e) => {
            target.rollback().await?;
            Err(e)
        }
    }
}

async fn backfill_pages(target: &mut dyn TargetStore, batch_size: usize) -> Result<BackfillOutcome> {
    let mut outcome = BackfillOutcome::default();
    let mut after: Option<ThingKey> = None;

    loop {
        let page = target.thing_page(after.as_ref(), batch_size).await?;
        let Some(last) = page.last() else { break };
        after = Some(last.key());

        for thing in &page {
            outcome.stats.total += 1;
            if thing.first_created.is_some() {
                outcome.stats.unchanged += 1;
                continue;
            }
            match decode_creation_time(&thing.name) {
                CreationTime::At(at) => {
                    if target.set_first_created(&thing.key(), at).await? {
                        debug!(user = %thing.user, name = %thing.name, %at, "Backfilled first_created");
                        outcome.stats.migrated += 1;
                    } else {
                        outcome.stats.unchanged += 1;
                    }
                }
                CreationTime::OutOfRange => outcome.stats.skipped += 1,
                CreationTime::Unparseable => {
                    outcome.stats.skipped += 1;
                    outcome.warnings.push(IntegrityWarning::new(
                        WarningKind::UnparseableCreationDate,
                        &thing.user,
                        &thing.name,
                        "name is not a base-36 number",
                    ));
                }
            }
        }

        if page.len() < batch_size {
            break;
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ThingRow;
    use crate::target::memory::MemoryTarget;

    /// Base-36 name encoding `secs`.
    fn name_for(secs: u128) -> String {
        let mut value = secs * SUFFIX_DIVISOR + 35;
        let mut digits = Vec::new();
        while value > 0 {
            digits.push(std::char::from_digit((value % 36) as u32, 36).unwrap());
            value /= 36;
        }
        digits.iter().rev().collect()
    }

    #[test]
    fn test_decode_timestamp_name() {
        let name = name_for(1_600_000_000);
        assert_eq!(
            decode_creation_time(&name),
            CreationTime::At(DateTime::from_timestamp(1_600_000_000, 0).unwrap())
        );
        assert_eq!(
            decode_creation_time(&name.to_uppercase()),
            decode_creation_time(&name)
        );
    }

    #[test]
    fn test_decode_bounds() {
        assert_eq!(decode_creation_time("abc"), CreationTime::OutOfRange);
        assert!(matches!(decode_creation_time(&name_for(1_000)), CreationTime::At(_)));
        assert!(matches!(
            decode_creation_time(&name_for(2_000_000_000)),
            CreationTime::At(_)
        ));
        assert_eq!(
            decode_creation_time(&name_for(2_000_000_001)),
            CreationTime::OutOfRange
        );
        assert_eq!(
            decode_creation_time(&"z".repeat(40)),
            CreationTime::OutOfRange
        );
    }

    #[test]
    fn test_decode_unparseable() {
        assert_eq!(decode_creation_time("my-page"), CreationTime::Unparseable);
        assert_eq!(decode_creation_time(""), CreationTime::Unparseable);
        assert_eq!(decode_creation_time("-"), CreationTime::Unparseable);
        assert_eq!(decode_creation_time("+-abc"), CreationTime::Unparseable);
        assert_eq!(decode_creation_time("a__b"), CreationTime::Unparseable);
        assert_eq!(decode_creation_time("_ab"), CreationTime::Unparseable);
    }

    #[test]
    fn test_decode_sign_and_whitespace() {
        let name = name_for(1_600_000_000);
        let at = decode_creation_time(&name);
        assert!(matches!(at, CreationTime::At(_)));
        assert_eq!(decode_creation_time(&format!("  {}\n", name)), at);
        assert_eq!(decode_creation_time(&format!("+{}", name)), at);
        assert_eq!(decode_creation_time(&format!("-{}", name)), CreationTime::OutOfRange);
        assert_eq!(decode_creation_time("-abc"), CreationTime::OutOfRange);

        let (head, tail) = name.split_at(3);
        assert_eq!(decode_creation_time(&format!("{}_{}", head, tail)), at);
    }

    #[tokio::test]
    async fn test_backfill_sets_only_missing_dates() {
        let preset = DateTime::from_timestamp(1_234_567_890, 0).unwrap();
        let decodable = name_for(1_600_000_000);
        let mut target = MemoryTarget::new();
        target.begin().await.unwrap();
        let preset_name = format!("{}x", decodable);
        for (name, first_created) in [
            (decodable.clone(), None),
            ("zz".to_string(), None),
            ("not-base36".to_string(), None),
            (preset_name.clone(), Some(preset)),
        ] {
            target
                .insert_thing(&ThingRow {
                    user: "ann".into(),
                    name,
                    content: String::new(),
                    json_content: None,
                    first_created,
                })
                .await
                .unwrap();
        }
        target.commit().await.unwrap();

        let outcome = backfill_first_created(&mut target, 2).await.unwrap();
        assert_eq!(outcome.stats.total, 4);
        assert_eq!(outcome.stats.migrated, 1);
        assert_eq!(outcome.stats.unchanged, 1);
        assert_eq!(outcome.stats.skipped, 2);
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].name, "not-base36");

        let tables = target.snapshot();
        assert_eq!(
            tables.things[&ThingKey::new("ann", &decodable)].first_created,
            DateTime::from_timestamp(1_600_000_000, 0)
        );
        assert_eq!(
            tables.things[&ThingKey::new("ann", &preset_name)].first_created,
            Some(preset)
        );
    }
}
