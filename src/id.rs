// Copyright 2022 jmjoy
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

//! Per-connection allocator of small positive integer identifiers.
//!
//! Identifiers are handed out lowest-free-first and released ids are
//! reused, so every free id stays below the current maximum id in use
//! and the set of live ids never grows past the number of concurrent
//! requests on the connection.
//!
//! In-use ids are kept as a sorted map of disjoint inclusive ranges
//! `low -> high`, which keeps both operations logarithmic in the number
//! of ranges rather than the number of ids.

use crate::error::{ServerError, ServerResult};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub(crate) struct IdAllocator {
    /// Disjoint, non-adjacent inclusive ranges of in-use ids.
    used_ranges: BTreeMap<u16, u16>,
    in_use: usize,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Allocates the lowest identifier not currently in use.
    ///
    /// Identifiers are strictly positive. Fails only when all `u16`
    /// identifiers are in use, which the per-connection request limit
    /// makes unreachable in practice.
    pub(crate) fn allocate(&mut self) -> ServerResult<u16> {
        let Some((&first_low, &first_high)) = self.used_ranges.iter().next() else {
            self.used_ranges.insert(1, 1);
            self.in_use = 1;
            return Ok(1);
        };

        if first_low > 1 {
            if first_low > 2 {
                self.used_ranges.insert(1, 1);
            } else {
                // Id 1 is adjacent to the first range; merge.
                self.used_ranges.remove(&first_low);
                self.used_ranges.insert(1, first_high);
            }
            self.in_use += 1;
            return Ok(1);
        }

        // The first range starts at 1; the new id extends it upward.
        let next_range = self
            .used_ranges
            .range(first_low + 1..)
            .next()
            .map(|(&low, &high)| (low, high));
        match next_range {
            Some((next_low, next_high)) => {
                let new_id = first_high + 1;
                if new_id + 1 == next_low {
                    // The new id fills the last free id below the next
                    // range; the two ranges become one.
                    self.used_ranges.remove(&next_low);
                    self.used_ranges.insert(first_low, next_high);
                } else {
                    self.used_ranges.insert(first_low, new_id);
                }
                self.in_use += 1;
                Ok(new_id)
            }
            None => {
                if first_high == u16::MAX {
                    return Err(ServerError::InterfaceCorrupted);
                }
                self.used_ranges.insert(first_low, first_high + 1);
                self.in_use += 1;
                Ok(first_high + 1)
            }
        }
    }

    /// Releases an identifier for reuse.
    ///
    /// Fails when `id` is not currently allocated; the caller treats
    /// that as an invariant violation.
    pub(crate) fn release(&mut self, id: u16) -> ServerResult<()> {
        let Some((low, high)) = self.containing_range(id) else {
            return Err(ServerError::InterfaceCorrupted);
        };

        if id == low {
            self.used_ranges.remove(&low);
            if id != high {
                self.used_ranges.insert(id + 1, high);
            }
        } else if id == high {
            self.used_ranges.insert(low, high - 1);
        } else {
            self.used_ranges.insert(low, id - 1);
            self.used_ranges.insert(id + 1, high);
        }
        self.in_use -= 1;
        Ok(())
    }

    /// Whether `id` is currently allocated.
    #[cfg(test)]
    pub(crate) fn in_use(&self, id: u16) -> bool {
        self.containing_range(id).is_some()
    }

    /// Number of identifiers currently allocated.
    pub(crate) fn allocated_count(&self) -> usize {
        self.in_use
    }

    /// Finds the in-use range containing `id`, if any.
    fn containing_range(&self, id: u16) -> Option<(u16, u16)> {
        let (&low, &high) = self.used_ranges.range(..=id).next_back()?;
        (low <= id && id <= high).then_some((low, high))
    }
}
