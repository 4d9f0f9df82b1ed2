//! Header chain tracking and best-chain selection.
//!
//! The tracker keeps one dense array for the current main chain plus the
//! set of all known chain heads. A single `append` entry point absorbs
//! newly learned headers as well as status changes on known ones, and
//! reports whether the main chain moved. Chains compete on cumulative
//! proof-of-work; a strictly greater total is required to displace the
//! current main chain.

use beck_core::types::Hash256;

use crate::index::{Arena, BlockId, BLOCK_FAILED_MASK};

/// Dense main-chain array indexed by height.
///
/// Invariant: the record in slot `h` has height `h` and its parent sits in
/// slot `h - 1`.
pub(crate) struct HeaderChain {
    slots: Vec<Option<BlockId>>,
}

impl HeaderChain {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Height of the tip, -1 when the chain is empty.
    pub(crate) fn height(&self) -> i32 {
        self.slots.len() as i32 - 1
    }

    /// Record at the tip.
    pub(crate) fn tip(&self) -> Option<BlockId> {
        self.slots.last().copied().flatten()
    }

    /// Record at `height`.
    pub(crate) fn at(&self, height: i32) -> Option<BlockId> {
        if height < 0 {
            return None;
        }
        self.slots.get(height as usize).copied().flatten()
    }

    /// Whether `id` lies on this chain.
    pub(crate) fn contains(&self, arena: &Arena, id: BlockId) -> bool {
        self.at(arena.entry(id).height) == Some(id)
    }

    /// Retarget the chain to end at `id`, rewriting slots top-down along
    /// the `prev` links and truncating anything above the new tip.
    pub(crate) fn set_tip(&mut self, arena: &Arena, id: BlockId) {
        let height = arena.entry(id).height;
        debug_assert!(height >= 0);
        self.slots.resize((height + 1) as usize, None);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let h = arena.entry(current).height;
            if h < 0 {
                break;
            }
            if self.slots[h as usize] == Some(current) {
                break; // the remainder already matches
            }
            self.slots[h as usize] = Some(current);
            cursor = arena.entry(current).prev;
        }
    }

    /// Hashes of the whole chain, genesis first.
    pub(crate) fn hashes(&self, arena: &Arena) -> Vec<Hash256> {
        self.slots
            .iter()
            .filter_map(|slot| slot.map(|id| arena.entry(id).hash))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }
}

/// The set of competing header chains and the designated best one.
pub(crate) struct ChainTracker {
    pub(crate) chain: HeaderChain,
    pub(crate) tips: Vec<BlockId>,
    pub(crate) best_header: Option<BlockId>,
}

impl ChainTracker {
    pub(crate) fn new() -> Self {
        Self {
            chain: HeaderChain::new(),
            tips: Vec::new(),
            best_header: None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.chain.clear();
        self.tips.clear();
        self.best_header = None;
    }

    fn is_failed(arena: &Arena, id: BlockId) -> bool {
        arena.entry(id).status & BLOCK_FAILED_MASK != 0
    }

    /// Absorb a newly learned header or a status change on a known one.
    /// Returns whether the main chain was modified.
    pub(crate) fn append(&mut self, arena: &Arena, id: BlockId) -> bool {
        let valid = !Self::is_failed(arena, id);
        // The genesis header may not be marked invalid.
        assert!(valid || arena.entry(id).prev.is_some());
        if valid && self.chain.contains(arena, id) {
            return false; // nothing to do
        }

        // Nearest non-failed ancestor; the record itself when it is valid.
        let mut anchor = if valid {
            id
        } else {
            arena
                .entry(id)
                .prev
                .expect("invalid non-genesis header must have a parent")
        };
        while Self::is_failed(arena, anchor) {
            anchor = arena
                .entry(anchor)
                .prev
                .expect("a chain of failed headers must bottom out in a valid one");
        }

        // Does the record sit on top of an existing tip? Then that chain
        // is extended (or, for an invalid record, cut back to the anchor).
        let mut found = false;
        let mut modifying_main_chain = false;
        for i in 0..self.tips.len() {
            let tip = self.tips[i];
            let tip_height = arena.entry(tip).height;
            if arena.get_ancestor(id, tip_height) == Some(tip) {
                self.tips.remove(i);
                self.tips.push(anchor);
                if Some(tip) == self.chain.tip() {
                    self.chain.set_tip(arena, anchor);
                    self.best_header = Some(anchor);
                    if valid {
                        return true;
                    }
                    // The main tip was invalidated; fall through so a
                    // stronger surviving chain can take over.
                    modifying_main_chain = true;
                }
                found = true;
                break;
            }
        }

        if !found {
            let mut modified = false;
            let mut already_contains = false;
            let height = arena.entry(id).height;
            let mut i = 0;
            while i < self.tips.len() {
                let tip = self.tips[i];
                if arena.get_ancestor(tip, height) == Some(id) {
                    // A chain running through this record already exists.
                    if valid {
                        return false;
                    }
                    modified = true;
                    let on_main = self.chain.contains(arena, tip);
                    self.tips.remove(i);
                    if on_main {
                        self.chain.set_tip(arena, anchor);
                    }
                    modifying_main_chain |= on_main;
                } else {
                    let anchor_height = arena.entry(anchor).height;
                    if arena.get_ancestor(tip, anchor_height) == Some(anchor) {
                        // Another chain already covers the anchor; keep
                        // whichever head carries more work.
                        already_contains = true;
                        if arena.entry(anchor).chain_work < arena.entry(tip).chain_work {
                            anchor = tip;
                        }
                    }
                    i += 1;
                }
            }
            if modified && !already_contains {
                self.tips.push(anchor);
            }
            if valid {
                self.tips.push(id);
                if self.chain.height() == -1 {
                    // First valid header: install the genesis.
                    self.chain.set_tip(arena, id);
                    self.best_header = Some(id);
                    return true;
                }
            }
        }

        let tip = self
            .chain
            .tip()
            .expect("the header chain holds at least the genesis here");
        let mut best = anchor;
        for &candidate in &self.tips {
            if arena.entry(candidate).chain_work > arena.entry(best).chain_work {
                best = candidate;
            }
        }
        if arena.entry(tip).chain_work < arena.entry(best).chain_work {
            self.chain.set_tip(arena, best);
            self.best_header = Some(if best == anchor && valid { id } else { best });
            modifying_main_chain = true;
        }
        modifying_main_chain
    }
}
