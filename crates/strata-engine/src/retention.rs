//! Which committed versions a retention policy removes.

use std::time::Duration;

use chrono::{DateTime, Utc};

use strata_catalog::{FilesetRecord, FilesetStatus};

/// Versions to delete from `filesets` (committed, any order).
///
/// Never selected: the newest fileset, the newest full fileset, and
/// partial filesets newer than the newest full one. Partial filesets older
/// than the newest full one are always selected. Among full filesets,
/// those beyond the `keep_versions` newest and those created before
/// `now - keep_time` are selected. Without any policy nothing is selected.
pub fn select_versions_to_delete(
    filesets: &[FilesetRecord],
    keep_versions: Option<u32>,
    keep_time: Option<Duration>,
    now: DateTime<Utc>,
) -> Vec<u64> {
    if keep_versions.is_none() && keep_time.is_none() {
        return Vec::new();
    }

    let mut sorted: Vec<&FilesetRecord> = filesets
        .iter()
        .filter(|f| f.status.is_committed())
        .collect();
    sorted.sort_by(|a, b| b.version.cmp(&a.version));

    let newest = sorted.first().map(|f| f.version);
    let newest_full = sorted
        .iter()
        .find(|f| f.status == FilesetStatus::Full)
        .map(|f| f.version);
    let cutoff = keep_time
        .and_then(|d| chrono::Duration::from_std(d).ok())
        .map(|d| now - d);

    let mut doomed = Vec::new();
    let mut fulls_seen = 0u32;
    for fileset in sorted {
        let protected = Some(fileset.version) == newest || Some(fileset.version) == newest_full;
        match fileset.status {
            FilesetStatus::Full => {
                fulls_seen += 1;
                if protected {
                    continue;
                }
                let over_count = keep_versions.is_some_and(|keep| fulls_seen > keep);
                let too_old = cutoff.is_some_and(|c| fileset.created < c);
                if over_count || too_old {
                    doomed.push(fileset.version);
                }
            }
            FilesetStatus::Partial => {
                let older_than_full = newest_full.is_some_and(|full| fileset.version < full);
                if !protected && older_than_full {
                    doomed.push(fileset.version);
                }
            }
            FilesetStatus::InProgress => {}
        }
    }
    doomed.sort_unstable();
    doomed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const DAY: i64 = 86_400;

    fn fileset(version: u64, full: bool, age_days: i64, now: DateTime<Utc>) -> FilesetRecord {
        FilesetRecord {
            version,
            created: now - chrono::Duration::seconds(age_days * DAY),
            status: if full {
                FilesetStatus::Full
            } else {
                FilesetStatus::Partial
            },
            file_count: 1,
            total_size: 1,
            failed_files: 0,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_no_policy_keeps_everything() {
        let n = now();
        let sets = vec![fileset(0, false, 3, n), fileset(1, true, 2, n)];
        assert!(select_versions_to_delete(&sets, None, None, n).is_empty());
    }

    #[test]
    fn test_keep_versions_with_partials() {
        let n = now();
        // F1 P2 P3 F4 P5, keep two full versions.
        let mut sets = vec![
            fileset(1, true, 5, n),
            fileset(2, false, 4, n),
            fileset(3, false, 3, n),
            fileset(4, true, 2, n),
            fileset(5, false, 1, n),
        ];
        let doomed = select_versions_to_delete(&sets, Some(2), None, n);
        assert_eq!(doomed, vec![2, 3]);

        sets.retain(|f| !doomed.contains(&f.version));
        sets.push(fileset(6, true, 0, n));
        let doomed = select_versions_to_delete(&sets, Some(2), None, n);
        assert_eq!(doomed, vec![1, 5]);
    }

    #[test]
    fn test_keep_time() {
        let n = now();
        let sets = vec![
            fileset(0, true, 10, n),
            fileset(1, true, 6, n),
            fileset(2, true, 1, n),
            fileset(3, false, 0, n),
        ];
        let doomed =
            select_versions_to_delete(&sets, None, Some(Duration::from_secs(5 * DAY as u64)), n);
        assert_eq!(doomed, vec![0, 1]);
    }

    #[test]
    fn test_latest_full_survives_even_when_old() {
        let n = now();
        let sets = vec![fileset(0, true, 30, n), fileset(1, false, 20, n)];
        let doomed =
            select_versions_to_delete(&sets, Some(1), Some(Duration::from_secs(DAY as u64)), n);
        assert!(doomed.is_empty());
    }

    #[test]
    fn test_only_partials() {
        let n = now();
        let sets = vec![fileset(0, false, 2, n), fileset(1, false, 1, n)];
        assert!(select_versions_to_delete(&sets, Some(1), None, n).is_empty());
    }
}
