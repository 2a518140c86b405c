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

//! Registered libraries and their translation tables
//!
//! A translation table ties the host entry table of one library to the
//! device image each device runs and, once loaded, to that device's entry
//! table. Host code pointers are resolved to device entry points through a
//! cache in front of a linear scan over every registered host table.
//!
//! Two locks: the library table and the host-pointer cache. They are never
//! held at the same time.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::address::{DeviceAddress, HostAddress};
use crate::error::{OffloadError, Result, lock};
use crate::plugin::{DeviceImage, HostEntry, TargetTable};

/// Handle of a registered library.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LibraryId(u64);

impl LibraryId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn from_u64(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lib#{}", self.0)
    }
}

pub(crate) struct TranslationTable {
    host_entries: Arc<[HostEntry]>,
    /// Image each device runs, by global device id.
    images: HashMap<usize, Arc<DeviceImage>>,
    /// Entry tables of devices the image has been loaded on.
    loaded: HashMap<usize, Arc<TargetTable>>,
}

#[derive(Default)]
pub struct ImageRegistry {
    libraries: Mutex<BTreeMap<LibraryId, TranslationTable>>,
    host_ptr_cache: Mutex<HashMap<HostAddress, (LibraryId, usize)>>,
    next_id: AtomicU64,
}

impl ImageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(
        &self,
        host_entries: Vec<HostEntry>,
        images: HashMap<usize, Arc<DeviceImage>>,
    ) -> Result<LibraryId> {
        let id = LibraryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.libraries, "library registry")?.insert(
            id,
            TranslationTable {
                host_entries: host_entries.into(),
                images,
                loaded: HashMap::new(),
            },
        );
        Ok(id)
    }

    /// Drops a library; returns the devices it had been loaded on.
    pub(crate) fn remove(&self, id: LibraryId) -> Result<Option<Vec<usize>>> {
        let removed = lock(&self.libraries, "library registry")?.remove(&id);
        let Some(table) = removed else {
            return Ok(None);
        };
        lock(&self.host_ptr_cache, "host pointer cache")?.retain(|_, (lib, _)| *lib != id);
        Ok(Some(table.loaded.into_keys().collect()))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(lock(&self.libraries, "library registry")?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub(crate) fn host_entries(&self, id: LibraryId) -> Result<Option<Arc<[HostEntry]>>> {
        Ok(lock(&self.libraries, "library registry")?
            .get(&id)
            .map(|t| t.host_entries.clone()))
    }

    pub(crate) fn target_table(
        &self,
        id: LibraryId,
        device: usize,
    ) -> Result<Option<Arc<TargetTable>>> {
        Ok(lock(&self.libraries, "library registry")?
            .get(&id)
            .and_then(|t| t.loaded.get(&device).cloned()))
    }

    /// Loads every library that has an image for `device` and is not yet
    /// loaded there through `load`, which receives the host entries and the
    /// image and returns the device table.
    ///
    /// The library lock is held throughout, so a library is loaded at most
    /// once per device.
    pub(crate) fn load_for_device<F>(&self, device: usize, mut load: F) -> Result<()>
    where
        F: FnMut(LibraryId, &[HostEntry], &DeviceImage) -> Result<TargetTable>,
    {
        let mut libraries = lock(&self.libraries, "library registry")?;
        for (id, table) in libraries.iter_mut() {
            if table.host_entries.is_empty() || table.loaded.contains_key(&device) {
                continue;
            }
            let Some(image) = table.images.get(&device).cloned() else {
                continue;
            };
            let loaded = match load(*id, &table.host_entries, &image) {
                Ok(t) => t,
                Err(e) => {
                    table.images.remove(&device);
                    return Err(e);
                }
            };
            if loaded.entries.len() != table.host_entries.len() {
                table.images.remove(&device);
                return Err(OffloadError::ImageLoad(format!(
                    "host and target tables mismatch for device {device} [{} != {}]",
                    table.host_entries.len(),
                    loaded.entries.len()
                )));
            }
            log::debug!(
                "{id}: loaded {} entries on device {device}",
                loaded.entries.len()
            );
            table.loaded.insert(device, Arc::new(loaded));
        }
        Ok(())
    }

    /// Host entry matching `host_ptr` by linear scan over every library.
    fn scan(&self, host_ptr: HostAddress) -> Result<Option<(LibraryId, usize)>> {
        Ok(lock(&self.libraries, "library registry")?
            .iter()
            .find_map(|(id, t)| {
                t.host_entries
                    .iter()
                    .position(|e| e.addr == host_ptr)
                    .map(|i| (*id, i))
            }))
    }

    fn is_registered(&self, id: LibraryId) -> Result<bool> {
        Ok(lock(&self.libraries, "library registry")?.contains_key(&id))
    }

    /// Device entry point for the host region stub at `host_ptr`.
    ///
    /// A cache hit whose library has been removed in the meantime is dropped
    /// and the lookup falls back to the scan.
    pub fn resolve(&self, host_ptr: HostAddress, device: usize) -> Result<DeviceAddress> {
        let cached = lock(&self.host_ptr_cache, "host pointer cache")?
            .get(&host_ptr)
            .copied();
        let hit = match cached {
            Some((id, index)) if self.is_registered(id)? => Some((id, index)),
            Some((stale, _)) => {
                log::debug!("dropping cached entry of removed {stale} for host {host_ptr}");
                lock(&self.host_ptr_cache, "host pointer cache")?
                    .retain(|ptr, (lib, _)| !(*ptr == host_ptr && *lib == stale));
                None
            }
            None => None,
        };
        let (id, index) = match hit {
            Some(hit) => hit,
            None => {
                let found = self
                    .scan(host_ptr)?
                    .ok_or(OffloadError::UnresolvedEntry(host_ptr))?;
                lock(&self.host_ptr_cache, "host pointer cache")?.insert(host_ptr, found);
                found
            }
        };
        let table = self
            .target_table(id, device)?
            .ok_or(OffloadError::UnresolvedEntry(host_ptr))?;
        table
            .entries
            .get(index)
            .map(|e| e.addr)
            .ok_or(OffloadError::UnresolvedEntry(host_ptr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_type::EntryFlags;
    use crate::plugin::TargetEntry;

    fn entry(name: &str, addr: usize) -> HostEntry {
        HostEntry {
            name: name.to_string(),
            addr: HostAddress::new(addr),
            size: 0,
            flags: EntryFlags::empty(),
        }
    }

    fn loaded(addrs: &[u64]) -> TargetTable {
        TargetTable {
            entries: addrs
                .iter()
                .map(|a| TargetEntry {
                    name: String::new(),
                    addr: DeviceAddress::new(*a),
                    size: 0,
                })
                .collect(),
        }
    }

    fn registry_with_one_library() -> (ImageRegistry, LibraryId) {
        let registry = ImageRegistry::new();
        let mut images = HashMap::new();
        images.insert(0, Arc::new(DeviceImage::default()));
        let id = registry
            .insert(vec![entry("a", 0x10), entry("b", 0x20)], images)
            .unwrap();
        (registry, id)
    }

    #[test]
    fn resolve_requires_loaded_table() {
        let (registry, _) = registry_with_one_library();
        assert!(matches!(
            registry.resolve(HostAddress::new(0x20), 0),
            Err(OffloadError::UnresolvedEntry(_))
        ));
        registry
            .load_for_device(0, |_, _, _| Ok(loaded(&[0x100, 0x200])))
            .unwrap();
        assert_eq!(
            registry.resolve(HostAddress::new(0x20), 0).unwrap(),
            DeviceAddress::new(0x200)
        );
        assert!(registry.resolve(HostAddress::new(0x30), 0).is_err());
    }

    #[test]
    fn load_happens_once_per_device() {
        let (registry, _) = registry_with_one_library();
        let mut calls = 0;
        for _ in 0..3 {
            registry
                .load_for_device(0, |_, _, _| {
                    calls += 1;
                    Ok(loaded(&[1, 2]))
                })
                .unwrap();
        }
        assert_eq!(calls, 1);
    }

    #[test]
    fn mismatched_table_invalidates_image() {
        let (registry, _) = registry_with_one_library();
        let err = registry
            .load_for_device(0, |_, _, _| Ok(loaded(&[1])))
            .unwrap_err();
        assert!(err.to_string().contains("mismatch"));
        // The image is gone, so nothing is loaded and nothing resolves.
        registry
            .load_for_device(0, |_, _, _| Ok(loaded(&[1, 2])))
            .unwrap();
        assert!(matches!(
            registry.resolve(HostAddress::new(0x10), 0),
            Err(OffloadError::UnresolvedEntry(_))
        ));
    }

    #[test]
    fn libraries_without_image_are_skipped() {
        let (registry, id) = registry_with_one_library();
        let mut calls = 0;
        registry
            .load_for_device(1, |_, _, _| {
                calls += 1;
                Ok(loaded(&[1, 2]))
            })
            .unwrap();
        assert_eq!(calls, 0);
        assert!(registry.target_table(id, 1).unwrap().is_none());
    }

    #[test]
    fn remove_purges_cache() {
        let (registry, id) = registry_with_one_library();
        registry
            .load_for_device(0, |_, _, _| Ok(loaded(&[0x100, 0x200])))
            .unwrap();
        registry.resolve(HostAddress::new(0x10), 0).unwrap();
        assert_eq!(registry.remove(id).unwrap(), Some(vec![0]));
        assert!(registry.resolve(HostAddress::new(0x10), 0).is_err());
        assert!(registry.is_empty().unwrap());
    }

    #[test]
    fn stale_cache_entry_falls_back_to_scan() {
        let (registry, old) = registry_with_one_library();
        registry
            .load_for_device(0, |_, _, _| Ok(loaded(&[0x100, 0x200])))
            .unwrap();
        registry.resolve(HostAddress::new(0x10), 0).unwrap();
        // A resolve that raced with remove() may leave its entry behind.
        registry.remove(old).unwrap();
        lock(&registry.host_ptr_cache, "host pointer cache")
            .unwrap()
            .insert(HostAddress::new(0x10), (old, 0));

        let mut images = HashMap::new();
        images.insert(0, Arc::new(DeviceImage::default()));
        let new = registry.insert(vec![entry("a", 0x10)], images).unwrap();
        registry
            .load_for_device(0, |_, _, _| Ok(loaded(&[0x300])))
            .unwrap();
        assert_eq!(
            registry.resolve(HostAddress::new(0x10), 0).unwrap(),
            DeviceAddress::new(0x300)
        );
        let cache = lock(&registry.host_ptr_cache, "host pointer cache").unwrap();
        assert_eq!(cache.get(&HostAddress::new(0x10)), Some(&(new, 0)));
    }
}
