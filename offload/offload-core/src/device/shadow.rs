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

use std::collections::BTreeMap;

use crate::address::{DeviceAddress, HostAddress};

/// A host pointer slot whose device copy holds a rewritten device address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShadowPointer {
    /// Address of the pointer slot on the host.
    pub host_slot: HostAddress,
    /// Value the host slot held before mapping.
    pub host_value: HostAddress,
    /// Address of the pointer slot's device copy.
    pub device_slot: DeviceAddress,
    /// Value written into the device slot.
    pub device_value: DeviceAddress,
}

impl ShadowPointer {
    /// Puts the original host value back into the host slot.
    ///
    /// # Safety
    /// `host_slot` must still be a writable pointer-sized host location.
    pub unsafe fn restore_host(&self) {
        unsafe { self.host_slot.write_pointer(self.host_value) }
    }
}

/// Shadow pointers of one device, ordered by host slot address.
#[derive(Debug, Default)]
pub struct ShadowPointerMap {
    entries: BTreeMap<HostAddress, ShadowPointer>,
}

impl ShadowPointerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, shadow: ShadowPointer) {
        self.entries.insert(shadow.host_slot, shadow);
    }

    pub fn get(&self, host_slot: &HostAddress) -> Option<&ShadowPointer> {
        self.entries.get(host_slot)
    }

    /// Shadows whose host slot lies in `[begin, end)`.
    pub fn in_range(&self, begin: HostAddress, end: HostAddress) -> Vec<ShadowPointer> {
        if begin >= end {
            return Vec::new();
        }
        self.entries.range(begin..end).map(|(_, s)| *s).collect()
    }

    /// Removes and returns the shadows whose host slot lies in `[begin, end)`.
    pub fn take_range(&mut self, begin: HostAddress, end: HostAddress) -> Vec<ShadowPointer> {
        let taken = self.in_range(begin, end);
        for shadow in &taken {
            self.entries.remove(&shadow.host_slot);
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shadow(slot: usize) -> ShadowPointer {
        ShadowPointer {
            host_slot: HostAddress::new(slot),
            host_value: HostAddress::new(0x5000),
            device_slot: DeviceAddress::new(0x9000 + slot as u64),
            device_value: DeviceAddress::new(0xa000),
        }
    }

    #[test]
    fn range_queries_are_half_open() {
        let mut map = ShadowPointerMap::new();
        for slot in [0x100, 0x108, 0x110, 0x200] {
            map.insert(shadow(slot));
        }
        let hits = map.in_range(HostAddress::new(0x100), HostAddress::new(0x110));
        assert_eq!(hits.len(), 2);
        let taken = map.take_range(HostAddress::new(0x108), HostAddress::new(0x201));
        assert_eq!(taken.len(), 3);
        assert_eq!(map.len(), 1);
        assert!(map.get(&HostAddress::new(0x100)).is_some());
    }

    #[test]
    fn restore_writes_original_value() {
        let mut slot: usize = 0xdead;
        let s = ShadowPointer {
            host_slot: HostAddress::from_mut_ptr(&mut slot as *mut usize),
            ..shadow(0)
        };
        unsafe { s.restore_host() };
        assert_eq!(slot, 0x5000);
    }
}
