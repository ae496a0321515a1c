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

//! The snapshot chain: a thin driver over a registry of peer store
//! descriptors, giving external callers a single `(volume_offset, size)`
//! read/write interface per snapshot instead of having to loop over
//! `StoreDescriptor::read`/`write` themselves.

use std::sync::Arc;

use vss_err::Result;
use vss_io::{Offset, VolumeIo};

use crate::store::StoreDescriptor;

/// An ordered collection of store descriptors that together form one
/// chain of snapshots sharing a volume image. `stores[0]` is conventionally
/// the most recent snapshot; `next_index` links on each descriptor walk
/// towards older snapshots.
pub struct SnapshotChain<VIO: VolumeIo> {
    io: Arc<VIO>,
    stores: Vec<StoreDescriptor<VIO>>,
}

impl<VIO: VolumeIo> SnapshotChain<VIO> {
    /// Builds a chain from already-parsed store descriptors, wiring each
    /// one's `next_index` to the one after it (`stores[i].next_index =
    /// Some(i + 1)`, the tail left at `None`).
    pub fn new(io: Arc<VIO>, mut stores: Vec<StoreDescriptor<VIO>>) -> Self {
        let last = stores.len().saturating_sub(1);
        for (i, store) in stores.iter_mut().enumerate() {
            store.next_index = if i < last { Some(i + 1) } else { None };
        }
        Self { io, stores }
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn store(&self, index: usize) -> Option<&StoreDescriptor<VIO>> {
        self.stores.get(index)
    }

    pub fn io(&self) -> &Arc<VIO> {
        &self.io
    }

    /// Reads `buffer.len()` bytes of snapshot `snapshot_index` starting at
    /// `volume_offset`. `StoreDescriptor::read` already drains a request
    /// that crosses 16 KiB block boundaries in one call; this loop exists
    /// to cover the case where it stops short of `buffer.len()` (an empty
    /// tail from a read that produced zero progress is returned as-is
    /// rather than spun on forever).
    pub fn read(&self, snapshot_index: usize, volume_offset: Offset, buffer: &mut [u8]) -> Result<usize> {
        let store = self
            .stores
            .get(snapshot_index)
            .ok_or(vss_err::Error::BadArgument("snapshot index out of range"))?;

        let mut produced = 0usize;
        while produced < buffer.len() {
            let n = store.read(&self.stores, snapshot_index, volume_offset + produced as u64, &mut buffer[produced..])?;
            if n == 0 {
                break;
            }
            produced += n;
        }
        Ok(produced)
    }

    /// Writes `buffer` to snapshot `snapshot_index` starting at
    /// `volume_offset`. `StoreDescriptor::write` is bounded to a single 16
    /// KiB block per call, so a request crossing a block boundary takes
    /// multiple invocations; this loop performs them.
    pub fn write(&self, snapshot_index: usize, volume_offset: Offset, buffer: &[u8]) -> Result<usize> {
        let store = self
            .stores
            .get(snapshot_index)
            .ok_or(vss_err::Error::BadArgument("snapshot index out of range"))?;

        let mut written = 0usize;
        while written < buffer.len() {
            let n = store.write(&self.stores, snapshot_index, volume_offset + written as u64, &buffer[written..])?;
            if n == 0 {
                break;
            }
            written += n;
        }
        Ok(written)
    }
}
