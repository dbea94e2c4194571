//! Volume-wide queries: usage statistics and the consistency check.

use alloc::{
    collections::BTreeSet,
    format,
    string::String,
    vec,
    vec::Vec,
};

use log::{debug, warn};
use serde::Serialize;

use crate::{
    block_dev::BlockDevice,
    common::{AlphaResult, BlockLoc, EntryKind},
    fs::AlphaFs,
    layout::NAME_LENGTH,
};

/// What `df` prints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsStat {
    pub volume_name: String,
    pub block_size: u32,
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub free_runs: usize,
    pub largest_free_run: u64,
    pub name_max: usize,
}

/// Result of walking the tree and the free list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub directories: u64,
    pub files: u64,
    pub links: u64,
    pub used_blocks: u64,
    pub free_blocks: u64,
    pub problems: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// A block range with the name of whatever claims it.
struct Claim {
    start: BlockLoc,
    count: u64,
    owner: String,
}

impl Claim {
    /// Counts come from disk, so the end saturates instead of overflowing.
    fn end(&self) -> BlockLoc {
        self.start.saturating_add(self.count)
    }
}

impl<D: BlockDevice> AlphaFs<D> {
    pub fn statfs(&self) -> AlphaResult<FsStat> {
        let runs = self.free_runs()?;
        let free_blocks = runs
            .iter()
            .fold(0u64, |total, run| total.saturating_add(run.count));
        Ok(FsStat {
            volume_name: self.descriptor.volume_name.clone(),
            block_size: self.geometry.block_size,
            total_blocks: self.geometry.total_blocks,
            used_blocks: self.geometry.total_blocks.saturating_sub(free_blocks),
            free_blocks,
            free_runs: runs.len(),
            largest_free_run: runs.iter().map(|run| run.count).max().unwrap_or(0),
            name_max: NAME_LENGTH - 1,
        })
    }

    /// Checks that every block is claimed exactly once, by the descriptor, an
    /// entry, a payload or a free run, and that the free list is properly
    /// linked. Never modifies the volume.
    pub fn check_consistency(&self) -> AlphaResult<ConsistencyReport> {
        let mut report = ConsistencyReport {
            used_blocks: self.geometry.descriptor_blocks,
            ..ConsistencyReport::default()
        };
        let mut claims = vec![Claim {
            start: 0,
            count: self.geometry.descriptor_blocks,
            owner: "system descriptor".into(),
        }];

        self.check_tree(&mut report, &mut claims);
        self.check_free_list(&mut report, &mut claims);

        claims.sort_by_key(|claim| claim.start);
        let mut claimed = 0u64;
        // furthest-reaching claim seen so far
        let mut reach: Option<&Claim> = None;
        for claim in &claims {
            match reach {
                Some(prev) if prev.end() > claim.start => {
                    report.problems.push(format!(
                        "{} overlaps {} at block {}",
                        prev.owner, claim.owner, claim.start
                    ));
                    if claim.end() > prev.end() {
                        reach = Some(claim);
                    }
                }
                _ => reach = Some(claim),
            }
            if claim.end() > self.geometry.total_blocks {
                report
                    .problems
                    .push(format!("{} extends past the end of the volume", claim.owner));
            }
            claimed = claimed.saturating_add(claim.count);
        }
        if claimed != self.geometry.total_blocks {
            report.problems.push(format!(
                "{} blocks claimed out of {}",
                claimed, self.geometry.total_blocks
            ));
        }

        if report.is_clean() {
            debug!("consistency check passed");
        } else {
            warn!("consistency check found {} problems", report.problems.len());
        }
        Ok(report)
    }

    fn check_tree(&self, report: &mut ConsistencyReport, claims: &mut Vec<Claim>) {
        let mut visited = BTreeSet::new();
        let mut stack = vec![self.descriptor.root];
        while let Some(loc) = stack.pop() {
            if !visited.insert(loc) {
                report
                    .problems
                    .push(format!("entry at block {} is reachable twice", loc));
                continue;
            }
            let entry = match self.read_entry(loc) {
                Ok(entry) => entry,
                Err(e) => {
                    report.problems.push(format!("{}", e));
                    continue;
                }
            };
            claims.push(Claim {
                start: loc,
                count: self.geometry.entry_blocks,
                owner: format!("entry '{}'", entry.name),
            });
            report.used_blocks += self.geometry.entry_blocks;

            match entry.kind {
                EntryKind::Directory => {
                    report.directories += 1;
                    stack.extend(entry.children.iter().copied());
                }
                kind => {
                    if kind.is_link() {
                        report.links += 1;
                    } else {
                        report.files += 1;
                    }
                    if !entry.children.is_empty() {
                        report
                            .problems
                            .push(format!("{} '{}' has child slots", kind, entry.name));
                    }
                }
            }

            match (entry.starting_block, entry.size) {
                (0, 0) => {}
                (start, size) if start != 0 && size != 0 && entry.kind.has_payload() => {
                    let count = self.geometry.blocks_for(size);
                    claims.push(Claim {
                        start,
                        count,
                        owner: format!("payload of '{}'", entry.name),
                    });
                    report.used_blocks = report.used_blocks.saturating_add(count);
                }
                (start, size) => report.problems.push(format!(
                    "'{}' has starting block {} with size {}",
                    entry.name, start, size
                )),
            }
        }
    }

    fn check_free_list(&self, report: &mut ConsistencyReport, claims: &mut Vec<Claim>) {
        let head = self.descriptor.free_head;
        if head == 0 {
            return;
        }
        let mut cur = head;
        for _ in 0..self.geometry.total_blocks {
            let node = match self.read_free_node(cur) {
                Ok(node) => node,
                Err(e) => {
                    report.problems.push(format!("{}", e));
                    return;
                }
            };
            if node.count == 0 {
                report
                    .problems
                    .push(format!("free run at block {} is empty", cur));
            }
            match self.read_free_node(node.next) {
                Ok(next) if next.prev == cur => {}
                Ok(_) => report.problems.push(format!(
                    "free run at block {} is not linked back from block {}",
                    cur, node.next
                )),
                Err(e) => {
                    report.problems.push(format!("{}", e));
                    return;
                }
            }
            claims.push(Claim {
                start: cur,
                count: node.count,
                owner: format!("free run at block {}", cur),
            });
            report.free_blocks = report.free_blocks.saturating_add(node.count);
            cur = node.next;
            if cur == head {
                return;
            }
        }
        report
            .problems
            .push(String::from("free list never returns to its head"));
    }
}
