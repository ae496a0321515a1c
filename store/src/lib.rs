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

//! Volume Shadow Snapshot store descriptor engine: parses a store's
//! catalog and metadata chains out of an NTFS-hosted VSS volume image and
//! serves copy-on-write-aware random reads and writes across a chain of
//! snapshots.

pub mod block;
pub mod chain;
pub mod codec;
pub mod descriptor;
pub mod runs;
pub mod store;
pub mod tree;

pub use chain::SnapshotChain;
pub use descriptor::BlockDescriptor;
pub use runs::RunList;
pub use store::StoreDescriptor;
