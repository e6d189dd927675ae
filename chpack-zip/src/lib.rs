// Copyright 2024 Google LLC
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

//! Byte-level access to the parts of a ZIP archive chpack cares about: the End
//! Of Central Directory record, the trailing comment and the tail of the file.
//! Nothing here decompresses or lists entries.

pub mod comment;
pub mod eocd;
pub mod window;

pub use eocd::{find_eocd, patch_cd_offset, EocdLocation, EocdRecord};
pub use window::{find_tail, read_framed_entry, read_framed_payload, KmpMatcher, TailWindow};
