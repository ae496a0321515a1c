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

//! The narrow capability set the store engine needs from its backing volume:
//! seek, positioned read, positioned write. Kept separate from the engine so
//! the same trait can be backed by a plain file, a block device, or a test
//! double.

pub use vss_err::{Error, Result};

/// An absolute byte offset within the volume image.
pub type Offset = u64;

pub trait VolumeIo {
    /// Moves the target's cursor to `offset`. Positioned read/write below do
    /// not depend on the cursor, but callers that mix seek-relative access
    /// with the store engine need this to stay in sync.
    fn seek(&self, offset: Offset) -> Result<()>;

    /// Reads `buffer.len()` bytes starting at `offset`. A short read is
    /// surfaced as `Error::Io`, never silently zero-padded.
    fn read_at(&self, offset: Offset, buffer: &mut [u8]) -> Result<()>;

    /// Writes `buffer` starting at `offset`. A short write is surfaced as
    /// `Error::Io`.
    fn write_at(&self, offset: Offset, buffer: &[u8]) -> Result<()>;
}
