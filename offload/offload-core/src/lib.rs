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

pub mod address;
pub mod args;
pub mod config;
pub mod device;
pub mod error;
pub mod launch;
pub mod map_type;
pub mod mapping;
pub mod plugin;
pub mod registry;
pub mod requires;
#[macro_use]
pub mod profiling;

pub use address::{DeviceAddress, HostAddress};
pub use args::{MapArg, Mapper, MapperComponents};
pub use config::{OffloadPolicy, RuntimeConfig};
pub use device::DeviceContext;
pub use error::{OFFLOAD_FAIL, OFFLOAD_SUCCESS, OffloadError, Result, status_code};
pub use launch::LaunchKind;
pub use map_type::{EntryFlags, MapType, RequiresFlags};
pub use plugin::{
    BinaryDescriptor, DeviceImage, DevicePlugin, HostEntry, HostPlugin, ImageEntry, KernelLaunch,
};
pub use registry::{ImageRegistry, LibraryId};

use std::collections::HashMap;
use std::sync::Arc;

use crate::requires::Requirements;

/// Device id meaning "the configured default device".
pub const DEFAULT_DEVICE: i64 = -1;

struct PluginSlot {
    plugin: Arc<dyn DevicePlugin>,
    /// Global id of the plugin's device 0.
    first_device: usize,
}

/// Main entry point of the offloading runtime
///
/// Owns every device of every plugin, the registered libraries and the
/// program's `requires` clauses. All methods take `&self` and may be called
/// from many host threads at once.
pub struct OffloadRuntime {
    config: RuntimeConfig,
    requirements: Arc<Requirements>,
    plugins: Vec<PluginSlot>,
    devices: Vec<DeviceContext>,
    registry: ImageRegistry,
}

impl OffloadRuntime {
    /// Builds a runtime over `plugins`; device ids follow plugin order.
    pub fn new(config: RuntimeConfig, plugins: Vec<Arc<dyn DevicePlugin>>) -> Result<Self> {
        config.validate()?;
        let requirements = Arc::new(Requirements::new());
        let mut slots = Vec::with_capacity(plugins.len());
        let mut devices = Vec::new();
        for plugin in plugins {
            let first_device = devices.len();
            let count = plugin.number_of_devices();
            for local_id in 0..count {
                devices.push(DeviceContext::new(
                    first_device + local_id,
                    plugin.clone(),
                    local_id,
                    requirements.clone(),
                ));
            }
            log::debug!(
                "plugin '{}' provides {count} devices starting at id {first_device}",
                plugin.name()
            );
            slots.push(PluginSlot {
                plugin,
                first_device,
            });
        }
        log::info!(
            "offload runtime: {} devices, policy {:?}",
            devices.len(),
            config.offload_policy
        );
        Ok(Self {
            config,
            requirements,
            plugins: slots,
            devices,
            registry: ImageRegistry::new(),
        })
    }

    /// Runtime whose only devices are those of a fresh `HostPlugin` sized by
    /// `config`. The plugin is returned so kernels can be registered on it.
    pub fn with_host_plugin(config: RuntimeConfig) -> Result<(Self, Arc<HostPlugin>)> {
        let host = Arc::new(HostPlugin::new(
            config.host_devices,
            config.async_queue_capacity,
        ));
        let runtime = Self::new(config, vec![host.clone()])?;
        Ok((runtime, host))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Id the host itself answers to in the device memory API.
    pub fn initial_device(&self) -> i64 {
        self.devices.len() as i64
    }

    pub fn registry(&self) -> &ImageRegistry {
        &self.registry
    }

    /// Whether target constructs run on the host instead.
    pub fn offload_disabled(&self) -> bool {
        match self.config.offload_policy {
            OffloadPolicy::Disabled => true,
            OffloadPolicy::Default => self.devices.is_empty(),
            OffloadPolicy::Mandatory => false,
        }
    }

    /// The device behind `device_id`; `DEFAULT_DEVICE` picks the configured one.
    pub fn device(&self, device_id: i64) -> Result<&DeviceContext> {
        let id = if device_id == DEFAULT_DEVICE {
            self.config.default_device
        } else {
            device_id
        };
        usize::try_from(id)
            .ok()
            .and_then(|i| self.devices.get(i))
            .ok_or(OffloadError::DeviceNotReady(id))
    }

    /// Readies the device, then runs `op` on it. Failures dump the device's
    /// mappings when `OFFLOAD_INFO` asks for it.
    fn on_device<T>(
        &self,
        device_id: i64,
        op: impl FnOnce(&DeviceContext) -> Result<T>,
    ) -> Result<T> {
        let device = self.device(device_id)?;
        let result = device.ensure_ready(&self.registry).and_then(|()| op(device));
        if let Err(ref e) = result {
            log::error!("device {}: {e}", device.id());
            if self.config.dump_on_failure()
                && let Err(dump) = device.dump_mappings()
            {
                log::warn!("device {}: failed to dump mappings: {dump}", device.id());
            }
        }
        result
    }

    pub fn register_requires(&self, flags: RequiresFlags) -> Result<()> {
        self.requirements.register(flags)?;
        for slot in &self.plugins {
            let honored = slot.plugin.init_requires(flags);
            if honored != flags {
                log::warn!(
                    "plugin '{}' only honors requires flags {honored:?} of {flags:?}",
                    slot.plugin.name()
                );
            }
        }
        Ok(())
    }

    /// Records a library's images and host entries.
    ///
    /// Each image goes to the first plugin that accepts it and is recorded
    /// for every device of that plugin. Loading happens lazily, on the next
    /// operation that touches such a device.
    pub fn register_library(&self, desc: BinaryDescriptor) -> Result<LibraryId> {
        crate::profile_scope!("Runtime::RegisterLibrary");
        let mut images = HashMap::new();
        for image in desc.images {
            let Some(slot) = self.plugins.iter().find(|s| s.plugin.is_valid_binary(&image))
            else {
                log::debug!("no plugin accepts image for '{}'", image.triple);
                continue;
            };
            log::debug!(
                "image for '{}' is compatible with plugin '{}'",
                image.triple,
                slot.plugin.name()
            );
            let image = Arc::new(image);
            for local_id in 0..slot.plugin.number_of_devices() {
                images.insert(slot.first_device + local_id, image.clone());
            }
        }
        let mut targets: Vec<usize> = images.keys().copied().collect();
        targets.sort_unstable();
        let id = self.registry.insert(desc.host_entries.clone(), images)?;
        for device in targets {
            self.devices[device].add_pending_library(id, &desc.host_entries)?;
        }
        log::debug!(
            "registered {id} with {} host entries",
            desc.host_entries.len()
        );
        Ok(id)
    }

    /// Runs the library's destructors where its constructors ran, drops its
    /// globals from every device and forgets it.
    pub fn unregister_library(&self, id: LibraryId) -> Result<()> {
        crate::profile_scope!("Runtime::UnregisterLibrary");
        for device in &self.devices {
            device.unload_library(id, &self.registry)?;
        }
        match self.registry.remove(id)? {
            Some(loaded_on) => {
                log::debug!("unregistered {id} (was loaded on devices {loaded_on:?})");
                Ok(())
            }
            None => Err(OffloadError::InvalidInput(format!("{id} is not registered"))),
        }
    }

    /// Entry to a `target data` region or `target enter data`.
    ///
    /// # Safety
    /// Every argument must describe host memory that stays valid for the
    /// call; see [`mapping::target_data_begin`].
    pub unsafe fn target_data_begin(&self, device_id: i64, args: &mut [MapArg]) -> Result<()> {
        if self.offload_disabled() {
            return Ok(());
        }
        self.on_device(device_id, |device| unsafe {
            mapping::target_data_begin(device, args, None)
        })
    }

    /// Exit from a `target data` region or `target exit data`.
    ///
    /// # Safety
    /// As for [`OffloadRuntime::target_data_begin`]; FROM arguments are written.
    pub unsafe fn target_data_end(&self, device_id: i64, args: &mut [MapArg]) -> Result<()> {
        if self.offload_disabled() {
            return Ok(());
        }
        self.on_device(device_id, |device| unsafe {
            mapping::target_data_end(device, args, None)
        })
    }

    /// `target update`.
    ///
    /// # Safety
    /// As for [`OffloadRuntime::target_data_end`].
    pub unsafe fn target_data_update(&self, device_id: i64, args: &mut [MapArg]) -> Result<()> {
        if self.offload_disabled() {
            return Ok(());
        }
        self.on_device(device_id, |device| unsafe {
            mapping::target_data_update(device, args, None)
        })
    }

    /// Runs the target region registered under `host_entry`.
    ///
    /// # Safety
    /// As for [`OffloadRuntime::target_data_begin`] and
    /// [`OffloadRuntime::target_data_end`] combined.
    pub unsafe fn target(
        &self,
        device_id: i64,
        host_entry: HostAddress,
        args: &mut [MapArg],
    ) -> Result<()> {
        unsafe { self.launch(device_id, host_entry, args, LaunchKind::Single) }
    }

    /// # Safety
    /// As for [`OffloadRuntime::target`].
    pub unsafe fn target_teams(
        &self,
        device_id: i64,
        host_entry: HostAddress,
        args: &mut [MapArg],
        team_count: i32,
        thread_limit: i32,
    ) -> Result<()> {
        let kind = LaunchKind::Teams {
            team_count,
            thread_limit,
        };
        unsafe { self.launch(device_id, host_entry, args, kind) }
    }

    unsafe fn launch(
        &self,
        device_id: i64,
        host_entry: HostAddress,
        args: &mut [MapArg],
        kind: LaunchKind,
    ) -> Result<()> {
        if self.offload_disabled() {
            return Err(OffloadError::OffloadDisabled);
        }
        self.on_device(device_id, |device| unsafe {
            launch::target(device, &self.registry, host_entry, args, kind)
        })
    }

    /// Trip count of the loop inside the next `target teams` launched by the
    /// calling thread on this device.
    pub fn push_target_trip_count(&self, device_id: i64, count: u64) -> Result<()> {
        if self.offload_disabled() {
            return Ok(());
        }
        self.on_device(device_id, |device| {
            log::debug!("device {}: pushing loop trip count {count}", device.id());
            device.push_loop_trip_count(std::thread::current().id(), count)
        })
    }

    /// Raw device memory outside any mapping. Zero bytes yields NULL.
    pub fn target_alloc(&self, size: usize, device_id: i64) -> Result<DeviceAddress> {
        if size == 0 {
            return Ok(DeviceAddress::NULL);
        }
        self.reject_initial_device(device_id, "target_alloc")?;
        let device = self.device(device_id)?;
        device.ensure_initialized()?;
        let ptr = device.alloc_data(size, HostAddress::NULL)?;
        log::debug!("device {}: target_alloc {size} bytes at {ptr}", device.id());
        Ok(ptr)
    }

    pub fn target_free(&self, ptr: DeviceAddress, device_id: i64) -> Result<()> {
        if ptr.is_null() {
            return Ok(());
        }
        self.reject_initial_device(device_id, "target_free")?;
        let device = self.device(device_id)?;
        device.ensure_initialized()?;
        device.delete_data(ptr)
    }

    fn reject_initial_device(&self, device_id: i64, what: &str) -> Result<()> {
        if device_id == self.initial_device() {
            return Err(OffloadError::InvalidInput(format!(
                "{what} on the initial device is served by the host allocator"
            )));
        }
        Ok(())
    }

    /// Whether `host` has a device copy. The host is present on itself.
    pub fn is_present(&self, host: HostAddress, device_id: i64) -> Result<bool> {
        if host.is_null() {
            return Ok(false);
        }
        if device_id == self.initial_device() {
            return Ok(true);
        }
        let device = self.device(device_id)?;
        if device.ensure_ready(&self.registry).is_err() {
            return Ok(false);
        }
        device.is_present(host)
    }

    /// Maps `[host, host + size)` to `device_ptr + device_offset`, memory the
    /// caller owns. The mapping is never freed by data operations.
    pub fn associate_ptr(
        &self,
        host: HostAddress,
        device_ptr: DeviceAddress,
        size: usize,
        device_offset: usize,
        device_id: i64,
    ) -> Result<()> {
        if host.is_null() || device_ptr.is_null() {
            return Err(OffloadError::InvalidInput(
                "associate_ptr needs non-null host and device pointers".to_string(),
            ));
        }
        self.reject_initial_device(device_id, "associate_ptr")?;
        self.on_device(device_id, |device| {
            device.associate(host, device_ptr.add(device_offset), size)
        })
    }

    pub fn disassociate_ptr(&self, host: HostAddress, device_id: i64) -> Result<()> {
        if host.is_null() {
            return Err(OffloadError::InvalidInput(
                "disassociate_ptr needs a non-null host pointer".to_string(),
            ));
        }
        self.reject_initial_device(device_id, "disassociate_ptr")?;
        self.on_device(device_id, |device| device.disassociate(host))
    }

    pub fn dump_mappings(&self, device_id: i64) -> Result<()> {
        self.device(device_id)?.dump_mappings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(devices: usize) -> (OffloadRuntime, Arc<HostPlugin>) {
        OffloadRuntime::with_host_plugin(RuntimeConfig {
            host_devices: devices,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn default_device_selection() {
        let (rt, _) = runtime(2);
        assert_eq!(rt.num_devices(), 2);
        assert_eq!(rt.device(DEFAULT_DEVICE).unwrap().id(), 0);
        assert_eq!(rt.device(1).unwrap().id(), 1);
        assert!(matches!(rt.device(2), Err(OffloadError::DeviceNotReady(2))));
        assert!(matches!(rt.device(-7), Err(OffloadError::DeviceNotReady(-7))));
    }

    #[test]
    fn policy_without_devices() {
        let default = OffloadRuntime::new(RuntimeConfig::default(), Vec::new()).unwrap();
        assert!(default.offload_disabled());

        let mandatory = OffloadRuntime::new(
            RuntimeConfig {
                offload_policy: OffloadPolicy::Mandatory,
                ..Default::default()
            },
            Vec::new(),
        )
        .unwrap();
        assert!(!mandatory.offload_disabled());
        let mut args = [MapArg::new(
            HostAddress::new(0x1000),
            HostAddress::new(0x1000),
            8,
            MapType::TO,
        )];
        let err = unsafe { mandatory.target_data_begin(DEFAULT_DEVICE, &mut args) }.unwrap_err();
        assert!(matches!(err, OffloadError::DeviceNotReady(0)));
    }

    #[test]
    fn disabled_policy_skips_data_and_refuses_launch() {
        let (rt, plugin) = OffloadRuntime::with_host_plugin(RuntimeConfig {
            offload_policy: OffloadPolicy::Disabled,
            ..Default::default()
        })
        .unwrap();
        let value = 1u64;
        let mut args = [MapArg::whole(&value, MapType::TO | MapType::TARGET_PARAM)];
        unsafe { rt.target_data_begin(0, &mut args) }.unwrap();
        assert_eq!(plugin.stats().allocations, 0);
        let err = unsafe { rt.target(0, HostAddress::new(0x10), &mut args) }.unwrap_err();
        assert!(matches!(err, OffloadError::OffloadDisabled));
    }

    #[test]
    fn device_memory_api() {
        let (rt, plugin) = runtime(1);
        assert_eq!(rt.target_alloc(0, 0).unwrap(), DeviceAddress::NULL);
        let ptr = rt.target_alloc(64, DEFAULT_DEVICE).unwrap();
        assert!(!ptr.is_null());

        let host = [0u8; 32];
        let host_addr = HostAddress::from_ptr(host.as_ptr());
        assert!(!rt.is_present(host_addr, 0).unwrap());
        assert!(rt.is_present(host_addr, rt.initial_device()).unwrap());
        rt.associate_ptr(host_addr, ptr, 32, 16, 0).unwrap();
        assert!(rt.is_present(host_addr.add(8), 0).unwrap());
        // Same association again is accepted, a different one is not.
        rt.associate_ptr(host_addr, ptr, 32, 16, 0).unwrap();
        assert!(rt.associate_ptr(host_addr, ptr, 32, 0, 0).is_err());
        rt.disassociate_ptr(host_addr, 0).unwrap();
        assert!(!rt.is_present(host_addr, 0).unwrap());

        rt.target_free(ptr, 0).unwrap();
        assert!(rt.target_alloc(8, rt.initial_device()).is_err());
        assert_eq!(plugin.stats().frees, 1);
    }

    #[test]
    fn unregister_unknown_library_fails() {
        let (rt, _) = runtime(1);
        let id = rt.register_library(BinaryDescriptor::default()).unwrap();
        rt.unregister_library(id).unwrap();
        assert!(rt.unregister_library(id).is_err());
    }

    #[test]
    fn failure_dump_keeps_the_original_error() {
        let (rt, _) = OffloadRuntime::with_host_plugin(RuntimeConfig {
            info: config::INFO_DUMP_ON_FAILURE,
            ..Default::default()
        })
        .unwrap();
        assert!(rt.config().dump_on_failure());
        let kept = [0u32; 4];
        let mut mapped = [MapArg::whole(&kept, MapType::TO)];
        unsafe { rt.target_data_begin(0, &mut mapped) }.unwrap();

        let missing = [0u32; 4];
        let mut args = [MapArg::whole(&missing, MapType::TO | MapType::PRESENT)];
        let err = unsafe { rt.target_data_begin(0, &mut args) }.unwrap_err();
        assert!(matches!(err, OffloadError::NotPresent { size: 16, .. }));
        assert_eq!(rt.device(0).unwrap().mapping_count().unwrap(), 1);
    }
}
