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

//! Lazy per-device initialization of globals and static constructors.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::Ordering;

use crate::device::DeviceContext;
use crate::error::{OffloadError, Result, lock};
use crate::map_type::EntryFlags;
use crate::plugin::{HostEntry, TargetTable};
use crate::registry::{ImageRegistry, LibraryId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GlobalsState {
    /// Libraries were registered since the device was last initialized.
    Pending,
    Initializing,
    #[default]
    Ready,
}

/// Constructors still to run and destructors to run at unload, as indices
/// into the library's host entry table.
#[derive(Debug, Default)]
struct PendingCtorsDtors {
    ctors: Vec<usize>,
    dtors: VecDeque<usize>,
}

#[derive(Debug, Default)]
pub(crate) struct GlobalsLatch {
    state: GlobalsState,
    libraries: BTreeMap<LibraryId, PendingCtorsDtors>,
}

fn run_entry(device: &DeviceContext, table: &TargetTable, index: usize) -> Result<()> {
    let entry = table.entries.get(index).ok_or_else(|| {
        OffloadError::ImageLoad(format!("entry {index} missing from device table"))
    })?;
    device
        .plugin()
        .run_team_region(device.local_id(), entry.addr, &[], &[], 1, 1, 0, None)
}

impl DeviceContext {
    /// Queues the constructors and destructors of a newly registered library
    /// and marks the device's globals as pending.
    pub(crate) fn add_pending_library(&self, id: LibraryId, entries: &[HostEntry]) -> Result<()> {
        let mut latch = lock(&self.globals, "pending globals")?;
        let pending = latch.libraries.entry(id).or_default();
        for (index, entry) in entries.iter().enumerate() {
            if entry.flags.contains(EntryFlags::CTOR) {
                log::debug!("device {}: pending ctor '{}' of {id}", self.id, entry.name);
                pending.ctors.push(index);
            } else if entry.flags.contains(EntryFlags::DTOR) {
                // Destructors run in reverse registration order.
                pending.dtors.push_front(index);
            }
        }
        latch.state = GlobalsState::Pending;
        self.globals_ready.store(false, Ordering::Release);
        Ok(())
    }

    pub fn globals_state(&self) -> Result<GlobalsState> {
        Ok(lock(&self.globals, "pending globals")?.state)
    }

    /// Initializes the device and then its globals.
    pub fn ensure_ready(&self, registry: &ImageRegistry) -> Result<()> {
        self.ensure_initialized()?;
        self.ensure_globals_initialized(registry)
    }

    /// Loads pending images, maps their globals and runs pending constructors,
    /// all under the globals lock so each constructor runs exactly once.
    pub fn ensure_globals_initialized(&self, registry: &ImageRegistry) -> Result<()> {
        if self.globals_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut latch = lock(&self.globals, "pending globals")?;
        if latch.state == GlobalsState::Ready {
            return Ok(());
        }
        crate::profile_scope!("Device::InitGlobals");
        latch.state = GlobalsState::Initializing;
        let result = self.initialize_globals(&mut latch, registry);
        match result {
            Ok(()) => {
                latch.state = GlobalsState::Ready;
                self.globals_ready.store(true, Ordering::Release);
            }
            Err(ref e) => {
                log::error!("device {}: globals initialization failed: {e}", self.id);
                latch.state = GlobalsState::Pending;
            }
        }
        result
    }

    fn initialize_globals(&self, latch: &mut GlobalsLatch, registry: &ImageRegistry) -> Result<()> {
        registry.load_for_device(self.id, |id, host_entries, image| {
            let table = self.plugin().load_binary(self.local_id(), image)?;
            if table.entries.len() != host_entries.len() {
                return Ok(table);
            }
            for (host, target) in host_entries.iter().zip(&table.entries) {
                if target.size == 0 {
                    continue;
                }
                if self.map_global(host.addr, target.addr, host.size)? {
                    log::debug!(
                        "{id}: global '{}' host {} -> device {} ({} bytes)",
                        host.name,
                        host.addr,
                        target.addr,
                        host.size
                    );
                }
            }
            Ok(table)
        })?;

        for (id, pending) in latch.libraries.iter_mut() {
            if pending.ctors.is_empty() {
                continue;
            }
            let table = registry.target_table(*id, self.id)?.ok_or_else(|| {
                OffloadError::ImageLoad(format!("{id} is not loaded on device {}", self.id))
            })?;
            for &index in &pending.ctors {
                run_entry(self, &table, index)?;
            }
            log::debug!(
                "device {}: ran {} ctors of {id}",
                self.id,
                pending.ctors.len()
            );
            pending.ctors.clear();
        }
        Ok(())
    }

    /// Runs the library's destructors if its constructors ran here, and drops
    /// its global mappings. Must be called before the library leaves the
    /// registry.
    pub(crate) fn unload_library(&self, id: LibraryId, registry: &ImageRegistry) -> Result<()> {
        let mut latch = lock(&self.globals, "pending globals")?;
        let Some(pending) = latch.libraries.remove(&id) else {
            return Ok(());
        };
        if pending.ctors.is_empty()
            && !pending.dtors.is_empty()
            && let Some(table) = registry.target_table(id, self.id)?
        {
            for &index in &pending.dtors {
                if let Err(e) = run_entry(self, &table, index) {
                    log::warn!("device {}: destructor of {id} failed: {e}", self.id);
                }
            }
        }
        if let Some(entries) = registry.host_entries(id)? {
            for entry in entries.iter().filter(|e| e.is_global()) {
                self.unmap_global(entry.addr)?;
            }
        }
        log::debug!("device {}: unloaded {id}", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::HostAddress;
    use crate::plugin::{DeviceImage, HOST_TRIPLE, HostPlugin, ImageEntry, KernelLaunch};
    use crate::requires::Requirements;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ctors_run_once_and_globals_are_mapped() {
        let plugin = Arc::new(HostPlugin::new(1, 4));
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        plugin
            .register_kernel(
                "ctor",
                Arc::new(move |_: &KernelLaunch<'_>| {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .unwrap();
        let device = DeviceContext::new(0, plugin.clone(), 0, Arc::new(Requirements::new()));
        let registry = ImageRegistry::new();

        let global = 7u64;
        let host_entries = vec![
            HostEntry {
                name: "ctor".into(),
                addr: HostAddress::new(0x10),
                size: 0,
                flags: EntryFlags::CTOR,
            },
            HostEntry {
                name: "g".into(),
                addr: HostAddress::from_ptr(&global as *const u64),
                size: 8,
                flags: EntryFlags::empty(),
            },
        ];
        let image = DeviceImage {
            triple: HOST_TRIPLE.into(),
            bytes: Vec::new(),
            entries: vec![
                ImageEntry {
                    name: "ctor".into(),
                    ..Default::default()
                },
                ImageEntry {
                    name: "g".into(),
                    size: 8,
                    ..Default::default()
                },
            ],
        };
        let mut images = HashMap::new();
        images.insert(0, Arc::new(image));
        let id = registry.insert(host_entries.clone(), images).unwrap();
        device.add_pending_library(id, &host_entries).unwrap();
        assert_eq!(device.globals_state().unwrap(), GlobalsState::Pending);

        device.ensure_ready(&registry).unwrap();
        device.ensure_ready(&registry).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(device.globals_state().unwrap(), GlobalsState::Ready);
        assert!(device.is_present(host_entries[1].addr).unwrap());

        device.unload_library(id, &registry).unwrap();
        assert!(!device.is_present(host_entries[1].addr).unwrap());
    }
}
