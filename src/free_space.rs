//! Free-space allocator.
//!
//! Free runs form a circular doubly-linked list. Each run's node lives in the
//! run's own first block, so the list costs no space beyond the free blocks
//! themselves. The head is kept in the system descriptor; 0 means no free
//! space is left.

use alloc::{vec, vec::Vec};

use log::{debug, trace};

use crate::{
    block_dev::BlockDevice,
    common::{AlphaError, AlphaResult, BlockLoc},
    fs::AlphaFs,
    layout::FreeNode,
};

/// A run of `count` free blocks starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct FreeRun {
    pub start: BlockLoc,
    pub count: u64,
}

impl FreeRun {
    /// One past the last block. Saturates on a corrupt count.
    pub fn end(&self) -> BlockLoc {
        self.start.saturating_add(self.count)
    }
}

impl<D: BlockDevice> AlphaFs<D> {
    pub(crate) fn read_free_node(&self, loc: BlockLoc) -> AlphaResult<FreeNode> {
        let buf = self.read_raw(loc, self.geometry.free_node_blocks)?;
        FreeNode::decode(&buf, loc)
    }

    pub(crate) fn write_free_node(&self, loc: BlockLoc, node: &FreeNode) -> AlphaResult<()> {
        self.check_range(loc, self.geometry.free_node_blocks)?;
        let mut buf = vec![0u8; self.geometry.bytes_for(self.geometry.free_node_blocks)];
        node.encode(&mut buf);
        self.device.write_blocks(loc, &buf)
    }

    fn set_next(&self, loc: BlockLoc, next: BlockLoc) -> AlphaResult<()> {
        let mut node = self.read_free_node(loc)?;
        node.next = next;
        self.write_free_node(loc, &node)
    }

    fn set_prev(&self, loc: BlockLoc, prev: BlockLoc) -> AlphaResult<()> {
        let mut node = self.read_free_node(loc)?;
        node.prev = prev;
        self.write_free_node(loc, &node)
    }

    fn set_free_head(&mut self, head: BlockLoc) -> AlphaResult<()> {
        if self.descriptor.free_head != head {
            self.descriptor.free_head = head;
            self.write_descriptor()?;
        }
        Ok(())
    }

    /// Makes everything from `start` to the end of the volume one free run.
    pub(crate) fn init_free_space(&mut self, start: BlockLoc) -> AlphaResult<()> {
        let count = self.geometry.total_blocks - start;
        self.write_free_node(
            start,
            &FreeNode {
                next: start,
                prev: start,
                count,
            },
        )?;
        self.descriptor.free_head = start;
        self.write_descriptor()
    }

    /// First-fit allocation of `blocks` contiguous blocks.
    ///
    /// `Ok(None)` when no run is large enough or `blocks` is 0.
    pub fn allocate(&mut self, blocks: u64) -> AlphaResult<Option<BlockLoc>> {
        let head = self.descriptor.free_head;
        if blocks == 0 || head == 0 {
            return Ok(None);
        }
        let mut cur = head;
        for _ in 0..self.geometry.total_blocks {
            let node = self.read_free_node(cur)?;
            if node.count >= blocks {
                self.take(cur, node, blocks)?;
                trace!("allocated {} blocks at {}", blocks, cur);
                return Ok(Some(cur));
            }
            cur = node.next;
            if cur == head {
                return Ok(None);
            }
        }
        Err(AlphaError::Corrupt(cur, "free list that never returns to its head"))
    }

    pub(crate) fn allocate_or_fail(&mut self, blocks: u64) -> AlphaResult<BlockLoc> {
        self.allocate(blocks)?
            .ok_or(AlphaError::OutOfSpace(blocks))
    }

    /// Consumes the first `blocks` blocks of the run at `loc`.
    fn take(&mut self, loc: BlockLoc, node: FreeNode, blocks: u64) -> AlphaResult<()> {
        let was_head = loc == self.descriptor.free_head;
        let alone = node.next == loc;

        if node.count == blocks {
            if alone {
                return self.set_free_head(0);
            }
            self.set_next(node.prev, node.next)?;
            self.set_prev(node.next, node.prev)?;
            if was_head {
                self.set_free_head(node.next)?;
            }
            return Ok(());
        }

        let rest = loc + blocks;
        let shrunk = if alone {
            FreeNode {
                next: rest,
                prev: rest,
                count: node.count - blocks,
            }
        } else {
            FreeNode {
                count: node.count - blocks,
                ..node
            }
        };
        self.write_free_node(rest, &shrunk)?;
        if !alone {
            self.set_next(node.prev, rest)?;
            self.set_prev(node.next, rest)?;
        }
        if was_head {
            self.set_free_head(rest)?;
        }
        Ok(())
    }

    /// Returns `count` blocks at `loc` to the free list, as its last run.
    ///
    /// Adjacent runs are not merged; see `coalesce_free_space`.
    pub fn release(&mut self, loc: BlockLoc, count: u64) -> AlphaResult<()> {
        if count == 0 {
            return Ok(());
        }
        if loc <= 1 || loc < self.geometry.descriptor_blocks {
            return Err(AlphaError::ReservedBlock(loc));
        }
        let end = loc.saturating_add(count);
        if end > self.geometry.total_blocks {
            return Err(AlphaError::OutOfRange(loc, end));
        }

        let head = self.descriptor.free_head;
        if head == 0 {
            self.write_free_node(
                loc,
                &FreeNode {
                    next: loc,
                    prev: loc,
                    count,
                },
            )?;
            self.set_free_head(loc)?;
        } else {
            let last = self.read_free_node(head)?.prev;
            self.write_free_node(
                loc,
                &FreeNode {
                    next: head,
                    prev: last,
                    count,
                },
            )?;
            self.set_next(last, loc)?;
            self.set_prev(head, loc)?;
        }
        trace!("released {} blocks at {}", count, loc);
        Ok(())
    }

    /// Free runs in list order, starting at the head.
    pub fn free_runs(&self) -> AlphaResult<Vec<FreeRun>> {
        let head = self.descriptor.free_head;
        let mut runs = Vec::new();
        if head == 0 {
            return Ok(runs);
        }
        let mut cur = head;
        for _ in 0..self.geometry.total_blocks {
            let node = self.read_free_node(cur)?;
            runs.push(FreeRun {
                start: cur,
                count: node.count,
            });
            cur = node.next;
            if cur == head {
                return Ok(runs);
            }
        }
        Err(AlphaError::Corrupt(cur, "free list that never returns to its head"))
    }

    pub fn free_blocks(&self) -> AlphaResult<u64> {
        Ok(self
            .free_runs()?
            .iter()
            .fold(0u64, |total, run| total.saturating_add(run.count)))
    }

    /// Merges adjacent free runs and relinks the list in address order.
    /// Returns the number of runs left.
    pub fn coalesce_free_space(&mut self) -> AlphaResult<usize> {
        let mut runs = self.free_runs()?;
        if runs.is_empty() {
            return Ok(0);
        }
        let before = runs.len();
        runs.sort();

        let mut merged: Vec<FreeRun> = Vec::with_capacity(runs.len());
        for run in runs {
            if run.count == 0 || run.end() > self.geometry.total_blocks {
                return Err(AlphaError::Corrupt(run.start, "free run outside the volume"));
            }
            match merged.last_mut() {
                Some(last) if last.end() > run.start => {
                    return Err(AlphaError::Corrupt(run.start, "free run overlapping another"));
                }
                Some(last) if last.end() == run.start => last.count += run.count,
                _ => merged.push(run),
            }
        }

        let n = merged.len();
        for (i, run) in merged.iter().enumerate() {
            let node = FreeNode {
                next: merged[(i + 1) % n].start,
                prev: merged[(i + n - 1) % n].start,
                count: run.count,
            };
            self.write_free_node(run.start, &node)?;
        }
        self.set_free_head(merged[0].start)?;
        debug!("coalesced {} free runs into {}", before, n);
        Ok(n)
    }
}
