// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The two ordered indexes kept over a store's block-descriptor arena: a
//! forward tree keyed by `original_offset` (what a reader looks up) and a
//! reverse tree keyed by `relative_offset` (what the current-bitmap logic
//! uses to tell "backed by a mapping in this store" from "free").

use std::collections::BTreeMap;

use crate::descriptor::{BlockDescriptor, FLAG_FORWARDER, FLAG_OVERLAY};

#[derive(Default)]
pub struct BlockDescriptorTree {
    forward: BTreeMap<u64, Vec<usize>>,
    reverse: BTreeMap<u64, usize>,
}

impl BlockDescriptorTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes `arena[idx]`, applying the overlay-pairing rule: a freshly
    /// inserted overlay pairs with an existing non-overlay sharing the same
    /// `original_offset` (and vice versa), with the *most recently
    /// inserted* overlay winning when more than one coexists for a key.
    /// Forwarders (`flags == 1`) are indexed in the forward tree only.
    pub fn insert(&mut self, idx: usize, arena: &mut [BlockDescriptor]) {
        let original_offset = arena[idx].original_offset;
        let relative_offset = arena[idx].relative_offset;
        let is_overlay = arena[idx].is_overlay();
        let is_forwarder = arena[idx].flags == FLAG_FORWARDER;

        let bucket = self.forward.entry(original_offset).or_default();
        if is_overlay {
            if let Some(&non_overlay) = bucket
                .iter()
                .find(|&&other| arena[other].flags != FLAG_OVERLAY)
            {
                arena[non_overlay].overlay = Some(idx);
            }
        } else if let Some(&overlay_idx) = bucket
            .iter()
            .rev()
            .find(|&&other| arena[other].is_overlay())
        {
            arena[idx].overlay = Some(overlay_idx);
        }
        bucket.push(idx);

        if !is_forwarder {
            self.reverse.insert(relative_offset, idx);
        }
    }

    pub fn forward_bucket(&self, original_offset: u64) -> Option<&[usize]> {
        self.forward.get(&original_offset).map(Vec::as_slice)
    }

    pub fn reverse_lookup(&self, relative_offset: u64) -> Option<usize> {
        self.reverse.get(&relative_offset).copied()
    }

    /// Picks the descriptor a reader should treat as "D" for a forward-tree
    /// bucket: the non-overlay entry if one is present, otherwise the most
    /// recently inserted overlay.
    pub fn pick_primary(&self, original_offset: u64, arena: &[BlockDescriptor]) -> Option<usize> {
        let bucket = self.forward.get(&original_offset)?;
        bucket
            .iter()
            .find(|&&idx| arena[idx].flags != FLAG_OVERLAY)
            .or_else(|| bucket.last())
            .copied()
    }
}
