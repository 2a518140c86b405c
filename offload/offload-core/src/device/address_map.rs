//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Host range -> device range table of one device.
//!
//! Entries are keyed by the first mapped host byte and never overlap, so the
//! only candidates for a query `[begin, end)` are the last entry starting at or
//! before `begin` and the first entry starting inside the query.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound::Excluded;

use crate::address::{DeviceAddress, HostAddress, HostRange};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefCount {
    Finite(u64),
    /// Backing storage of a global or a user-associated pointer; never evicted.
    Infinite,
}

impl RefCount {
    pub fn is_infinite(self) -> bool {
        matches!(self, RefCount::Infinite)
    }

    /// The next release drops the count to zero.
    pub fn is_last(self) -> bool {
        matches!(self, RefCount::Finite(n) if n <= 1)
    }
}

impl fmt::Display for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefCount::Finite(n) => write!(f, "{n}"),
            RefCount::Infinite => f.write_str("INF"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub host: HostRange,
    pub device_begin: DeviceAddress,
    pub ref_count: RefCount,
}

impl MapEntry {
    pub fn new(host: HostRange, device_begin: DeviceAddress, ref_count: RefCount) -> Self {
        Self {
            host,
            device_begin,
            ref_count,
        }
    }

    pub fn translate(&self, host: HostAddress) -> DeviceAddress {
        self.host.translate(self.device_begin, host)
    }

    pub fn increment(&mut self) {
        if let RefCount::Finite(n) = &mut self.ref_count {
            *n += 1;
        }
    }

    pub fn decrement(&mut self) {
        if let RefCount::Finite(n) = &mut self.ref_count {
            *n = n.saturating_sub(1);
        }
    }
}

/// How a query range relates to the entry it hit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Overlap {
    Contained,
    /// The query starts before the entry and runs into it.
    ExtendsBefore,
    /// The query starts inside the entry and runs past its end.
    ExtendsAfter,
}

#[derive(Debug, Default)]
pub struct AddressMap {
    entries: BTreeMap<HostAddress, MapEntry>,
}

impl AddressMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the entry that `[begin, begin + size)` falls into or overlaps.
    pub fn lookup(&self, begin: HostAddress, size: usize) -> Option<(HostAddress, Overlap)> {
        let end = begin.add(size);
        if let Some((key, entry)) = self.entries.range(..=begin).next_back()
            && begin < entry.host.end
        {
            let overlap = if end <= entry.host.end {
                Overlap::Contained
            } else {
                Overlap::ExtendsAfter
            };
            return Some((*key, overlap));
        }
        if size == 0 {
            return None;
        }
        self.entries
            .range((Excluded(begin), Excluded(end)))
            .next()
            .map(|(key, _)| (*key, Overlap::ExtendsBefore))
    }

    /// The entry fully containing `[begin, begin + size)`, if any.
    pub fn find_containing(&self, begin: HostAddress, size: usize) -> Option<&MapEntry> {
        match self.lookup(begin, size) {
            Some((key, Overlap::Contained)) => self.entries.get(&key),
            _ => None,
        }
    }

    pub fn get(&self, key: &HostAddress) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &HostAddress) -> Option<&mut MapEntry> {
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, entry: MapEntry) {
        self.entries.insert(entry.host.begin, entry);
    }

    pub fn remove(&mut self, key: &HostAddress) -> Option<MapEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MapEntry> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(begin: usize, size: usize) -> AddressMap {
        let mut map = AddressMap::new();
        let b = HostAddress::new(begin);
        map.insert(MapEntry::new(
            HostRange::new(b, b, size),
            DeviceAddress::new(0x9000),
            RefCount::Finite(1),
        ));
        map
    }

    #[test]
    fn lookup_classifies_overlap() {
        let map = map_with(0x100, 0x40);
        let key = HostAddress::new(0x100);
        assert_eq!(
            map.lookup(HostAddress::new(0x110), 0x10),
            Some((key, Overlap::Contained))
        );
        assert_eq!(
            map.lookup(HostAddress::new(0xf0), 0x20),
            Some((key, Overlap::ExtendsBefore))
        );
        assert_eq!(
            map.lookup(HostAddress::new(0x130), 0x20),
            Some((key, Overlap::ExtendsAfter))
        );
        assert_eq!(map.lookup(HostAddress::new(0x140), 0x10), None);
        assert_eq!(map.lookup(HostAddress::new(0xc0), 0x40), None);
    }

    #[test]
    fn zero_size_queries() {
        let map = map_with(0x100, 0x40);
        assert!(map.find_containing(HostAddress::new(0x120), 0).is_some());
        assert!(map.find_containing(HostAddress::new(0x140), 0).is_none());
    }

    #[test]
    fn translate_within_entry() {
        let map = map_with(0x100, 0x40);
        let e = map.find_containing(HostAddress::new(0x108), 8).unwrap();
        assert_eq!(e.translate(HostAddress::new(0x108)), DeviceAddress::new(0x9008));
    }

    #[test]
    fn infinite_entries_ignore_counting() {
        let b = HostAddress::new(0x100);
        let mut e = MapEntry::new(HostRange::new(b, b, 8), DeviceAddress::new(1), RefCount::Infinite);
        e.decrement();
        e.increment();
        assert_eq!(e.ref_count, RefCount::Infinite);
        assert!(!e.ref_count.is_last());
        assert!(RefCount::Finite(1).is_last());
        assert!(RefCount::Finite(0).is_last());
        assert!(!RefCount::Finite(2).is_last());
    }
}
