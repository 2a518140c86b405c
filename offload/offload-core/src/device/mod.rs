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

//! Per-device state
//!
//! Lock order, outermost first: globals latch, library registry, address map.
//! The shadow-pointer lock is only ever taken on its own. No lock is held
//! across a data transfer.

pub mod address_map;
mod globals;
pub mod shadow;

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::ThreadId;

use crate::address::{DeviceAddress, HostAddress, HostRange};
use crate::error::{OffloadError, Result, lock};
use crate::plugin::{AsyncInfo, DevicePlugin};
use crate::requires::Requirements;

pub use address_map::{AddressMap, MapEntry, Overlap, RefCount};
pub(crate) use globals::GlobalsLatch;
pub use globals::GlobalsState;
pub use shadow::{ShadowPointer, ShadowPointerMap};

/// Options of one `get_or_alloc` request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocRequest {
    pub base: HostAddress,
    pub begin: HostAddress,
    pub size: usize,
    /// The mapping was introduced by the compiler, not the user.
    pub implicit: bool,
    pub update_ref: bool,
    /// `close`: map even under unified shared memory.
    pub force_device: bool,
    /// `present`: never allocate.
    pub require_present: bool,
}

/// Where a section landed on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedSection {
    pub device_begin: DeviceAddress,
    /// The section got a fresh device buffer.
    pub is_new: bool,
    /// Unified shared memory: the device uses the host address directly.
    pub is_host_ptr: bool,
}

/// Result of looking up a section that is expected to be mapped already.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExistingSection {
    pub device_begin: DeviceAddress,
    /// Releasing this reference frees the entry.
    pub is_last: bool,
    pub is_host_ptr: bool,
}

pub struct DeviceContext {
    id: usize,
    plugin: Arc<dyn DevicePlugin>,
    local_id: usize,
    requirements: Arc<Requirements>,
    init: OnceLock<bool>,
    address_map: Mutex<AddressMap>,
    shadow_pointers: Mutex<ShadowPointerMap>,
    globals: Mutex<GlobalsLatch>,
    globals_ready: AtomicBool,
    loop_trip_counts: Mutex<HashMap<ThreadId, u64>>,
}

impl DeviceContext {
    pub fn new(
        id: usize,
        plugin: Arc<dyn DevicePlugin>,
        local_id: usize,
        requirements: Arc<Requirements>,
    ) -> Self {
        Self {
            id,
            plugin,
            local_id,
            requirements,
            init: OnceLock::new(),
            address_map: Mutex::default(),
            shadow_pointers: Mutex::default(),
            globals: Mutex::default(),
            globals_ready: AtomicBool::new(true),
            loop_trip_counts: Mutex::default(),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin.name()
    }

    pub(crate) fn plugin(&self) -> &dyn DevicePlugin {
        self.plugin.as_ref()
    }

    pub(crate) fn local_id(&self) -> usize {
        self.local_id
    }

    pub fn unified_shared_memory(&self) -> bool {
        self.requirements.unified_shared_memory()
    }

    /// Initializes the device through its plugin on first use. A device whose
    /// initialization failed stays unusable.
    pub fn ensure_initialized(&self) -> Result<()> {
        let ok = *self.init.get_or_init(|| match self.plugin.init_device(self.local_id) {
            Ok(()) => {
                log::debug!(
                    "device {} ({} #{}) initialized",
                    self.id,
                    self.plugin.name(),
                    self.local_id
                );
                true
            }
            Err(e) => {
                log::error!("device {} failed to initialize: {e}", self.id);
                false
            }
        });
        if ok {
            Ok(())
        } else {
            Err(OffloadError::DeviceNotReady(self.id as i64))
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.init.get().copied().unwrap_or(false)
    }

    /// Finds the device copy of `[begin, begin + size)` or allocates one.
    ///
    /// Returns `None` when nothing is mapped and nothing was allocated: the
    /// request required presence, or asked for zero bytes.
    pub fn get_or_alloc(&self, req: &AllocRequest) -> Result<Option<MappedSection>> {
        let mut map = lock(&self.address_map, "address map")?;
        match map.lookup(req.begin, req.size) {
            Some((key, overlap)) if overlap == Overlap::Contained || req.implicit => {
                let entry = map
                    .get_mut(&key)
                    .ok_or_else(|| OffloadError::InvalidInput("address map lost an entry".into()))?;
                if req.update_ref {
                    entry.increment();
                }
                let device_begin = entry.translate(req.begin);
                log::debug!(
                    "mapping exists{}: host {} -> device {device_begin}, size {}, ref count {}",
                    if req.implicit { " (implicit)" } else { "" },
                    req.begin,
                    req.size,
                    entry.ref_count
                );
                Ok(Some(MappedSection {
                    device_begin,
                    is_new: false,
                    is_host_ptr: false,
                }))
            }
            Some((key, _)) => {
                let (mapped_begin, mapped_size) = map
                    .get(&key)
                    .map(|e| (e.host.begin, e.host.size()))
                    .unwrap_or((key, 0));
                Err(OffloadError::IllegalExtension {
                    addr: req.begin,
                    size: req.size,
                    mapped_begin,
                    mapped_size,
                })
            }
            // 'present' holds under unified shared memory too.
            None if req.require_present => {
                log::debug!(
                    "host {} ({} bytes) not mapped and 'present' requested",
                    req.begin,
                    req.size
                );
                Ok(None)
            }
            None if self.unified_shared_memory() && !req.force_device => {
                if req.size == 0 {
                    return Ok(None);
                }
                log::debug!("unified shared memory: host {} used directly", req.begin);
                Ok(Some(MappedSection {
                    device_begin: DeviceAddress::unified(req.begin),
                    is_new: false,
                    is_host_ptr: true,
                }))
            }
            None if req.size == 0 => Ok(None),
            None => {
                // Allocate under the lock so concurrent requests for the same
                // range share one buffer.
                let device_begin = self
                    .plugin
                    .data_alloc(self.local_id, req.size, req.begin)?;
                let ref_count = RefCount::Finite(u64::from(req.update_ref));
                map.insert(MapEntry::new(
                    HostRange::new(req.base, req.begin, req.size),
                    device_begin,
                    ref_count,
                ));
                log::debug!(
                    "new mapping: host base {} begin {} -> device {device_begin}, size {}, ref count {ref_count}",
                    req.base,
                    req.begin,
                    req.size
                );
                Ok(Some(MappedSection {
                    device_begin,
                    is_new: true,
                    is_host_ptr: false,
                }))
            }
        }
    }

    /// Looks up a section that should already be mapped, dropping one
    /// reference when `update_ref` is set and it is not the last one.
    pub fn lookup_existing(
        &self,
        begin: HostAddress,
        size: usize,
        update_ref: bool,
    ) -> Result<Option<ExistingSection>> {
        let mut map = lock(&self.address_map, "address map")?;
        if let Some((key, _)) = map.lookup(begin, size) {
            let entry = map
                .get_mut(&key)
                .ok_or_else(|| OffloadError::InvalidInput("address map lost an entry".into()))?;
            let is_last = entry.ref_count.is_last();
            if !is_last && update_ref {
                entry.decrement();
            }
            let device_begin = entry.translate(begin);
            log::debug!(
                "found mapping: host {begin} -> device {device_begin}, size {size}, ref count {}",
                entry.ref_count
            );
            return Ok(Some(ExistingSection {
                device_begin,
                is_last,
                is_host_ptr: false,
            }));
        }
        if self.unified_shared_memory() {
            return Ok(Some(ExistingSection {
                device_begin: DeviceAddress::unified(begin),
                is_last: false,
                is_host_ptr: true,
            }));
        }
        Ok(None)
    }

    /// Drops one reference to the entry holding `[begin, begin + size)` and
    /// frees it when none are left. `force_delete` drops all of them.
    pub fn release(
        &self,
        begin: HostAddress,
        size: usize,
        force_delete: bool,
        has_close: bool,
    ) -> Result<()> {
        if self.unified_shared_memory() && !has_close {
            return Ok(());
        }
        let freed = {
            let mut map = lock(&self.address_map, "address map")?;
            let key = map
                .lookup(begin, size)
                .map(|(key, _)| key)
                .ok_or(OffloadError::NotMapped { addr: begin, size })?;
            let entry = map
                .get_mut(&key)
                .ok_or(OffloadError::NotMapped { addr: begin, size })?;
            if force_delete && !entry.ref_count.is_infinite() {
                entry.ref_count = RefCount::Finite(1);
            }
            entry.decrement();
            if entry.ref_count == RefCount::Finite(0) {
                map.remove(&key)
            } else {
                None
            }
        };
        let Some(entry) = freed else {
            return Ok(());
        };
        // The entry is gone from the map, so the buffer is ours to free unlocked.
        self.plugin.data_delete(self.local_id, entry.device_begin)?;
        log::debug!(
            "deleted device data {} for host {} ({} bytes)",
            entry.device_begin,
            entry.host.begin,
            entry.host.size()
        );
        let dropped = lock(&self.shadow_pointers, "shadow pointer map")?
            .take_range(entry.host.begin, entry.host.end);
        if !dropped.is_empty() {
            log::debug!("dropped {} shadow pointers with freed entry", dropped.len());
        }
        Ok(())
    }

    /// Reference count of the entry containing `begin`.
    pub fn ref_count(&self, begin: HostAddress) -> Result<Option<RefCount>> {
        Ok(lock(&self.address_map, "address map")?
            .find_containing(begin, 0)
            .map(|e| e.ref_count))
    }

    pub fn is_present(&self, begin: HostAddress) -> Result<bool> {
        if lock(&self.address_map, "address map")?
            .find_containing(begin, 0)
            .is_some()
        {
            return Ok(true);
        }
        Ok(self.unified_shared_memory())
    }

    /// Maps `[host, host + size)` onto memory the user already owns on the
    /// device. Such entries are never freed by the runtime.
    pub fn associate(&self, host: HostAddress, device: DeviceAddress, size: usize) -> Result<()> {
        let mut map = lock(&self.address_map, "address map")?;
        if let Some((key, overlap)) = map.lookup(host, size) {
            let existing = map
                .get(&key)
                .ok_or_else(|| OffloadError::InvalidInput("address map lost an entry".into()))?;
            if overlap == Overlap::Contained && existing.translate(host) == device {
                return Ok(());
            }
            return Err(OffloadError::InvalidInput(format!(
                "host {host} ({size} bytes) is already mapped to {}",
                existing.translate(existing.host.begin)
            )));
        }
        map.insert(MapEntry::new(
            HostRange::new(host, host, size),
            device,
            RefCount::Infinite,
        ));
        log::debug!("associated host {host} with device {device} ({size} bytes)");
        Ok(())
    }

    pub fn disassociate(&self, host: HostAddress) -> Result<()> {
        let mut map = lock(&self.address_map, "address map")?;
        match map.get(&host) {
            Some(entry) if entry.ref_count.is_infinite() => {
                map.remove(&host);
                log::debug!("disassociated host {host}");
                Ok(())
            }
            _ => Err(OffloadError::InvalidInput(format!(
                "host {host} is not an associated pointer"
            ))),
        }
    }

    /// Adds a global's mapping unless some entry already covers it.
    pub(crate) fn map_global(
        &self,
        host: HostAddress,
        device: DeviceAddress,
        size: usize,
    ) -> Result<bool> {
        let mut map = lock(&self.address_map, "address map")?;
        if map.lookup(host, size).is_some() {
            return Ok(false);
        }
        map.insert(MapEntry::new(
            HostRange::new(host, host, size),
            device,
            RefCount::Infinite,
        ));
        Ok(true)
    }

    pub(crate) fn unmap_global(&self, host: HostAddress) -> Result<()> {
        let mut map = lock(&self.address_map, "address map")?;
        if map.get(&host).is_some_and(|e| e.ref_count.is_infinite()) {
            map.remove(&host);
        }
        Ok(())
    }

    pub fn record_shadow(&self, shadow: ShadowPointer) -> Result<()> {
        lock(&self.shadow_pointers, "shadow pointer map")?.insert(shadow);
        Ok(())
    }

    pub fn shadows_in_range(&self, begin: HostAddress, end: HostAddress) -> Result<Vec<ShadowPointer>> {
        Ok(lock(&self.shadow_pointers, "shadow pointer map")?.in_range(begin, end))
    }

    pub fn take_shadows_in_range(
        &self,
        begin: HostAddress,
        end: HostAddress,
    ) -> Result<Vec<ShadowPointer>> {
        Ok(lock(&self.shadow_pointers, "shadow pointer map")?.take_range(begin, end))
    }

    pub fn shadow_count(&self) -> Result<usize> {
        Ok(lock(&self.shadow_pointers, "shadow pointer map")?.len())
    }

    /// Allocation outside the address map, e.g. for private copies.
    pub fn alloc_data(&self, size: usize, host: HostAddress) -> Result<DeviceAddress> {
        self.plugin.data_alloc(self.local_id, size, host)
    }

    pub fn delete_data(&self, ptr: DeviceAddress) -> Result<()> {
        self.plugin.data_delete(self.local_id, ptr)
    }

    pub fn submit(
        &self,
        dst: DeviceAddress,
        src: &[u8],
        async_info: Option<&mut AsyncInfo>,
    ) -> Result<()> {
        log::debug!("copy {} bytes host -> device {dst}", src.len());
        self.plugin.data_submit(self.local_id, dst, src, async_info)
    }

    /// # Safety
    /// `dst` must stay writable for `size` bytes until the copy completes.
    pub unsafe fn retrieve(
        &self,
        dst: HostAddress,
        src: DeviceAddress,
        size: usize,
        async_info: Option<&mut AsyncInfo>,
    ) -> Result<()> {
        log::debug!("copy {size} bytes device {src} -> host {dst}");
        unsafe {
            self.plugin
                .data_retrieve(self.local_id, dst, src, size, async_info)
        }
    }

    pub fn synchronize(&self, async_info: &mut AsyncInfo) -> Result<()> {
        self.plugin.synchronize(self.local_id, async_info)
    }

    pub fn push_loop_trip_count(&self, thread: ThreadId, count: u64) -> Result<()> {
        lock(&self.loop_trip_counts, "loop trip counts")?.insert(thread, count);
        Ok(())
    }

    /// Consumes the trip count recorded for `thread`; zero when none was.
    pub fn take_loop_trip_count(&self, thread: ThreadId) -> Result<u64> {
        Ok(lock(&self.loop_trip_counts, "loop trip counts")?
            .remove(&thread)
            .unwrap_or(0))
    }

    pub fn mapping_count(&self) -> Result<usize> {
        Ok(lock(&self.address_map, "address map")?.len())
    }

    /// Copy of the current address map, ordered by host address.
    pub fn snapshot(&self) -> Result<Vec<MapEntry>> {
        Ok(lock(&self.address_map, "address map")?.iter().cloned().collect())
    }

    pub fn dump_mappings(&self) -> Result<()> {
        let entries = self.snapshot()?;
        log::info!(
            "device {} ({}) host-device pointer mappings: {} entries",
            self.id,
            self.plugin.name(),
            entries.len()
        );
        for e in &entries {
            log::info!(
                "  host {} (base {}) -> device {} size {} ref count {}",
                e.host.begin,
                e.host.base,
                e.device_begin,
                e.host.size(),
                e.ref_count
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::HostPlugin;

    fn device() -> (DeviceContext, Arc<HostPlugin>) {
        let plugin = Arc::new(HostPlugin::new(1, 4));
        let dev = DeviceContext::new(0, plugin.clone(), 0, Arc::new(Requirements::new()));
        dev.ensure_initialized().unwrap();
        (dev, plugin)
    }

    fn req(begin: usize, size: usize) -> AllocRequest {
        AllocRequest {
            base: HostAddress::new(begin),
            begin: HostAddress::new(begin),
            size,
            update_ref: true,
            ..Default::default()
        }
    }

    #[test]
    fn get_or_alloc_then_reuse() {
        let (dev, plugin) = device();
        let first = dev.get_or_alloc(&req(0x1000, 64)).unwrap().unwrap();
        assert!(first.is_new);
        let inner = dev.get_or_alloc(&req(0x1010, 16)).unwrap().unwrap();
        assert!(!inner.is_new);
        assert_eq!(inner.device_begin, first.device_begin.add(0x10));
        assert_eq!(
            dev.ref_count(HostAddress::new(0x1000)).unwrap(),
            Some(RefCount::Finite(2))
        );
        assert_eq!(plugin.stats().allocations, 1);
    }

    #[test]
    fn explicit_extension_is_rejected_implicit_is_not() {
        let (dev, _) = device();
        dev.get_or_alloc(&req(0x1000, 64)).unwrap();
        let err = dev.get_or_alloc(&req(0x1020, 64)).unwrap_err();
        assert!(matches!(err, OffloadError::IllegalExtension { .. }));
        let implicit = AllocRequest {
            implicit: true,
            ..req(0x1020, 64)
        };
        assert!(dev.get_or_alloc(&implicit).unwrap().is_some());
    }

    #[test]
    fn present_and_zero_size_do_not_allocate() {
        let (dev, plugin) = device();
        let present = AllocRequest {
            require_present: true,
            ..req(0x1000, 64)
        };
        assert!(dev.get_or_alloc(&present).unwrap().is_none());
        assert!(dev.get_or_alloc(&req(0x1000, 0)).unwrap().is_none());
        assert_eq!(plugin.stats().allocations, 0);
        assert_eq!(dev.mapping_count().unwrap(), 0);
    }

    #[test]
    fn release_frees_at_zero() {
        let (dev, plugin) = device();
        dev.get_or_alloc(&req(0x1000, 64)).unwrap();
        dev.get_or_alloc(&req(0x1000, 64)).unwrap();
        let e = dev
            .lookup_existing(HostAddress::new(0x1000), 64, true)
            .unwrap()
            .unwrap();
        assert!(!e.is_last);
        let e = dev
            .lookup_existing(HostAddress::new(0x1000), 64, true)
            .unwrap()
            .unwrap();
        assert!(e.is_last);
        dev.release(HostAddress::new(0x1000), 64, false, false).unwrap();
        assert_eq!(dev.mapping_count().unwrap(), 0);
        assert_eq!(plugin.stats().frees, 1);
        assert!(matches!(
            dev.release(HostAddress::new(0x1000), 64, false, false),
            Err(OffloadError::NotMapped { .. })
        ));
    }

    #[test]
    fn force_delete_ignores_ref_count() {
        let (dev, _) = device();
        for _ in 0..3 {
            dev.get_or_alloc(&req(0x1000, 8)).unwrap();
        }
        dev.release(HostAddress::new(0x1000), 8, true, false).unwrap();
        assert_eq!(dev.mapping_count().unwrap(), 0);
    }

    #[test]
    fn associated_entries_survive_release() {
        let (dev, _) = device();
        let buf = dev.alloc_data(32, HostAddress::NULL).unwrap();
        dev.associate(HostAddress::new(0x2000), buf, 32).unwrap();
        dev.release(HostAddress::new(0x2000), 32, true, false).unwrap();
        assert!(dev.is_present(HostAddress::new(0x2010)).unwrap());
        assert!(dev.disassociate(HostAddress::new(0x2010)).is_err());
        dev.disassociate(HostAddress::new(0x2000)).unwrap();
        assert!(!dev.is_present(HostAddress::new(0x2000)).unwrap());
        dev.delete_data(buf).unwrap();
    }

    #[test]
    fn trip_count_is_consumed_once() {
        let (dev, _) = device();
        let me = std::thread::current().id();
        dev.push_loop_trip_count(me, 128).unwrap();
        assert_eq!(dev.take_loop_trip_count(me).unwrap(), 128);
        assert_eq!(dev.take_loop_trip_count(me).unwrap(), 0);
    }

    #[test]
    fn unified_memory_uses_host_addresses() {
        let plugin = Arc::new(HostPlugin::new(1, 4));
        let requirements = Arc::new(Requirements::new());
        requirements
            .register(crate::map_type::RequiresFlags::UNIFIED_SHARED_MEMORY)
            .unwrap();
        let dev = DeviceContext::new(0, plugin.clone(), 0, requirements);
        dev.ensure_initialized().unwrap();
        let m = dev.get_or_alloc(&req(0x3000, 16)).unwrap().unwrap();
        assert!(m.is_host_ptr);
        assert!(m.device_begin.is_same_as_host(HostAddress::new(0x3000)));
        assert_eq!(plugin.stats().allocations, 0);

        let close = AllocRequest {
            force_device: true,
            ..req(0x3000, 16)
        };
        assert!(dev.get_or_alloc(&close).unwrap().unwrap().is_new);
    }
}
