use std::collections::HashMap;

use loli::{DumpRow, Fingerprint};
use serde::Serialize;

/// Live memory attributed to one call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSite {
    pub call_site: String,
    pub bytes: u64,
    pub blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub bytes: u64,
    pub blocks: u64,
    pub call_sites: Vec<CallSite>,
}

/// Change of one call stack between two dumps, `target - base`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSiteDelta {
    pub call_site: String,
    pub delta_bytes: i64,
    pub delta_blocks: i64,
    pub target_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub base_bytes: u64,
    pub target_bytes: u64,
    pub delta_bytes: i64,
    pub base_blocks: u64,
    pub target_blocks: u64,
    pub call_sites: Vec<CallSiteDelta>,
}

/// Group key of a row, the innermost `depth` frames when set.
fn key(fingerprint: &Fingerprint, depth: Option<usize>) -> Fingerprint {
    match depth {
        Some(depth) if depth < fingerprint.frames().len() => {
            Fingerprint::new(fingerprint.frames()[..depth].to_vec())
        }
        _ => fingerprint.clone(),
    }
}

fn group(rows: &[DumpRow], depth: Option<usize>) -> HashMap<Fingerprint, (u64, u64)> {
    let mut sites: HashMap<Fingerprint, (u64, u64)> = HashMap::new();

    for row in rows {
        let site = sites.entry(key(&row.fingerprint, depth)).or_default();
        site.0 += row.size as u64;
        site.1 += 1;
    }

    sites
}

/// Per call site totals, largest first.
pub fn summarize(rows: &[DumpRow], depth: Option<usize>) -> Summary {
    let mut call_sites = group(rows, depth)
        .into_iter()
        .map(|(fingerprint, (bytes, blocks))| CallSite {
            call_site: fingerprint.to_string(),
            bytes,
            blocks,
        })
        .collect::<Vec<_>>();

    call_sites.sort_by(|a, b| {
        b.bytes
            .cmp(&a.bytes)
            .then_with(|| a.call_site.cmp(&b.call_site))
    });

    Summary {
        bytes: call_sites.iter().map(|site| site.bytes).sum(),
        blocks: call_sites.iter().map(|site| site.blocks).sum(),
        call_sites,
    }
}

/// Per call site growth from `base` to `target`, biggest growth first. Unchanged sites are
/// omitted.
pub fn diff(base: &[DumpRow], target: &[DumpRow], depth: Option<usize>) -> Diff {
    let base_sites = group(base, depth);
    let target_sites = group(target, depth);

    let mut call_sites = vec![];

    let added = target_sites
        .keys()
        .filter(|key| !base_sites.contains_key(*key));

    for fingerprint in base_sites.keys().chain(added) {
        let (base_bytes, base_blocks) = base_sites
            .get(fingerprint)
            .copied()
            .unwrap_or_default();
        let (target_bytes, target_blocks) = target_sites
            .get(fingerprint)
            .copied()
            .unwrap_or_default();

        let delta = CallSiteDelta {
            call_site: fingerprint.to_string(),
            delta_bytes: target_bytes as i64 - base_bytes as i64,
            delta_blocks: target_blocks as i64 - base_blocks as i64,
            target_bytes,
        };

        if delta.delta_bytes != 0 || delta.delta_blocks != 0 {
            call_sites.push(delta);
        }
    }

    call_sites.sort_by(|a, b| {
        b.delta_bytes
            .cmp(&a.delta_bytes)
            .then_with(|| a.call_site.cmp(&b.call_site))
    });

    let base_bytes = base.iter().map(|row| row.size as u64).sum::<u64>();
    let target_bytes = target.iter().map(|row| row.size as u64).sum::<u64>();

    Diff {
        base_bytes,
        target_bytes,
        delta_bytes: target_bytes as i64 - base_bytes as i64,
        base_blocks: base.len() as u64,
        target_blocks: target.len() as u64,
        call_sites,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(address: usize, size: usize, frames: &[usize]) -> DumpRow {
        DumpRow {
            address,
            size,
            fingerprint: Fingerprint::new(frames.to_vec()),
            timestamp: 0,
        }
    }

    #[test]
    fn summary_groups_by_stack() {
        let rows = vec![
            row(0x1000, 100, &[0xa, 0xb]),
            row(0x2000, 300, &[0xa, 0xb]),
            row(0x3000, 1000, &[0xc]),
        ];

        let summary = summarize(&rows, None);

        assert_eq!(summary.bytes, 1400);
        assert_eq!(summary.blocks, 3);
        assert_eq!(
            summary.call_sites,
            vec![
                CallSite {
                    call_site: "0xc".into(),
                    bytes: 1000,
                    blocks: 1
                },
                CallSite {
                    call_site: "0xa;0xb".into(),
                    bytes: 400,
                    blocks: 2
                },
            ]
        );
    }

    #[test]
    fn summary_depth_merges_callers() {
        let rows = vec![row(0x1000, 100, &[0xa, 0xb]), row(0x2000, 300, &[0xa, 0xc])];

        let summary = summarize(&rows, Some(1));

        assert_eq!(summary.call_sites.len(), 1);
        assert_eq!(summary.call_sites[0].call_site, "0xa");
        assert_eq!(summary.call_sites[0].bytes, 400);
    }

    #[test]
    fn diff_reports_growth_first() {
        let base = vec![
            row(0x1000, 100, &[0xa]),
            row(0x2000, 500, &[0xb]),
            row(0x3000, 50, &[0xd]),
        ];

        let target = vec![
            row(0x1000, 100, &[0xa]),
            row(0x4000, 100, &[0xb]),
            row(0x5000, 2000, &[0xc]),
            row(0x6000, 50, &[0xd]),
        ];

        let diff = diff(&base, &target, None);

        assert_eq!(diff.base_bytes, 650);
        assert_eq!(diff.target_bytes, 2250);
        assert_eq!(diff.delta_bytes, 1600);
        assert_eq!((diff.base_blocks, diff.target_blocks), (3, 4));

        let sites = diff
            .call_sites
            .iter()
            .map(|site| (site.call_site.as_str(), site.delta_bytes, site.delta_blocks))
            .collect::<Vec<_>>();

        assert_eq!(sites, vec![("0xc", 2000, 1), ("0xb", -400, 0)]);
    }

    #[test]
    fn diff_of_equal_dumps_is_empty() {
        let rows = vec![row(0x1000, 100, &[0xa])];

        let diff = diff(&rows, &rows, None);

        assert_eq!(diff.delta_bytes, 0);
        assert!(diff.call_sites.is_empty());
    }
}
