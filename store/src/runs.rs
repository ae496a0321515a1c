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

//! Free-space tracker: a list of 128 KiB-aligned regions ("runs"), each
//! covered by a bitmap with one bit per 16 KiB allocation slot (MSB-first:
//! bit *n* of a byte is `0x80 >> n`). A run only ever grows; overlapping
//! `add_run` calls extend a run's bitmap rather than creating a second one.

use vss_err::{Error, Result};

const RUN_ALIGNMENT: u64 = 128 * 1024;
const SLOT_SIZE: u64 = 16 * 1024;

pub struct BlockRun {
    start_offset: u64,
    size: u64,
    bitmap: Vec<u8>,
    first_free_addr: u64,
    free_space: u64,
    full: bool,
}

impl BlockRun {
    fn update_next_free(&mut self) {
        let start_byte = (self.first_free_addr - self.start_offset) / RUN_ALIGNMENT;
        let mut found = None;

        'outer: for (i, byte) in self.bitmap.iter().enumerate().skip(start_byte as usize) {
            if *byte != 0xFF {
                for n in 0..8u8 {
                    if byte & (0x80u8 >> n) == 0 {
                        found = Some(
                            self.start_offset + (i as u64) * RUN_ALIGNMENT + (n as u64) * SLOT_SIZE,
                        );
                        break 'outer;
                    }
                }
            }
        }

        match found {
            Some(addr) => self.first_free_addr = addr,
            None => {
                self.free_space = 0;
                self.full = true;
                self.first_free_addr = 0;
            }
        }
    }

    fn contains(&self, offset: u64) -> bool {
        offset >= self.start_offset && offset < self.start_offset + self.size
    }

    fn mark_as_used(&mut self, offset: u64) {
        let byte_offset = ((offset - self.start_offset) / RUN_ALIGNMENT) as usize;
        let bit_offset = (((offset - self.start_offset) % RUN_ALIGNMENT) / SLOT_SIZE) as u8;
        let mask = 0x80u8 >> bit_offset;

        if self.bitmap[byte_offset] & mask != 0 {
            return;
        }
        self.bitmap[byte_offset] |= mask;
        self.free_space -= SLOT_SIZE;

        if self.free_space == 0 {
            self.full = true;
            self.first_free_addr = 0;
            return;
        }

        let first_free_byte = ((self.first_free_addr - self.start_offset) / RUN_ALIGNMENT) as usize;
        let first_free_bit =
            (((self.first_free_addr - self.start_offset) % RUN_ALIGNMENT) / SLOT_SIZE) as u8;
        if byte_offset == first_free_byte && bit_offset == first_free_bit {
            self.update_next_free();
        }
    }
}

#[derive(Default)]
pub struct RunList {
    runs: Vec<BlockRun>,
}

impl RunList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extends the tracker to cover `[start_offset, start_offset + size)`,
    /// rounded inward to 128 KiB boundaries. A request degenerate after
    /// rounding (less than 128 KiB of aligned span) is rejected.
    pub fn add_run(&mut self, start_offset: u64, size: u64) -> Result<()> {
        let run_start = start_offset - (start_offset % RUN_ALIGNMENT) + RUN_ALIGNMENT;
        let run_stop = (start_offset + size) - ((start_offset + size) % RUN_ALIGNMENT);
        if run_stop <= run_start {
            return Err(Error::BadArgument("run size rounds down to zero"));
        }
        let run_size = run_stop - run_start;
        let bitmap_size = (run_size / RUN_ALIGNMENT) as usize;

        if let Some(existing) = self.runs.iter_mut().find(|r| r.start_offset == run_start) {
            let existing_bitmap_size = existing.bitmap.len();
            if existing_bitmap_size == bitmap_size {
                return Ok(());
            }
            if existing_bitmap_size > bitmap_size {
                return Err(Error::BadArgument(
                    "attempted to re-add an existing run smaller than the one on file",
                ));
            }

            let old_size = existing.size;
            let old_free_space = existing.free_space;
            existing.bitmap.resize(bitmap_size, 0);
            existing.bitmap[existing_bitmap_size] = 0xFF;
            existing.size = run_size;
            existing.free_space = run_size - old_size + old_free_space - RUN_ALIGNMENT;
            existing.full = false;
            existing.first_free_addr = run_start;
            existing.update_next_free();
            return Ok(());
        }

        self.runs.push(BlockRun {
            start_offset: run_start,
            size: run_size,
            bitmap: vec![0u8; bitmap_size],
            first_free_addr: run_start,
            free_space: run_size,
            full: false,
        });
        Ok(())
    }

    /// Returns the next free 16 KiB slot and marks it used, or `0` if every
    /// tracked run is exhausted. `0` doubles as a sentinel here because a
    /// run never legitimately starts at volume offset zero.
    pub fn get_next_free(&mut self) -> u64 {
        for run in self.runs.iter_mut() {
            if run.full {
                continue;
            }
            let next_free = run.first_free_addr;
            run.mark_as_used(next_free);
            return next_free;
        }
        0
    }

    pub fn mark_as_used(&mut self, offset: u64) -> Result<()> {
        let run = self
            .runs
            .iter_mut()
            .find(|r| r.contains(offset))
            .ok_or(Error::BadArgument("offset is not covered by any run"))?;
        run.mark_as_used(offset);
        Ok(())
    }

    pub fn total_size(&self) -> u64 {
        self.runs.iter().map(|r| r.size).sum()
    }

    pub fn free_size(&self) -> u64 {
        self.runs.iter().map(|r| r.free_space).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_space_round_trip_depletes_by_slot_size() {
        let mut runs = RunList::new();
        runs.add_run(0, 1024 * 1024).unwrap();
        let total_free = runs.free_size();

        let mut allocated = Vec::new();
        loop {
            let addr = runs.get_next_free();
            if addr == 0 {
                break;
            }
            allocated.push(addr);
        }

        assert_eq!(allocated.len() as u64 * SLOT_SIZE, total_free);
        assert_eq!(runs.free_size(), 0);
        assert_eq!(runs.get_next_free(), 0);
    }

    #[test]
    fn add_run_exact_duplicate_is_a_no_op() {
        let mut runs = RunList::new();
        runs.add_run(0, 256 * 1024).unwrap();
        let free_before = runs.free_size();
        runs.add_run(0, 256 * 1024).unwrap();
        assert_eq!(runs.free_size(), free_before);
        assert_eq!(runs.runs.len(), 1);
    }

    #[test]
    fn add_run_smaller_duplicate_errors() {
        let mut runs = RunList::new();
        runs.add_run(0, 512 * 1024).unwrap();
        assert!(runs.add_run(0, 256 * 1024).is_err());
    }

    #[test]
    fn add_run_larger_duplicate_expands_bitmap() {
        let mut runs = RunList::new();
        runs.add_run(0, 256 * 1024).unwrap();
        let small_total = runs.total_size();

        runs.add_run(0, 512 * 1024).unwrap();
        assert!(runs.total_size() > small_total);
        assert_eq!(runs.runs.len(), 1);
    }

    #[test]
    fn mark_as_used_rejects_offset_outside_any_run() {
        let mut runs = RunList::new();
        runs.add_run(0, 256 * 1024).unwrap();
        assert!(runs.mark_as_used(10 * 1024 * 1024).is_err());
    }
}
