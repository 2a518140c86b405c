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

//! Device plugin interface
//!
//! A plugin drives one family of accelerators. The runtime only ever talks to
//! devices through this trait; device ids passed to a plugin are local to it.

pub mod host;
mod worker;

use std::any::Any;

use crate::address::{DeviceAddress, HostAddress};
use crate::error::Result;
use crate::map_type::{EntryFlags, RequiresFlags};

pub use host::{HOST_TRIPLE, HostKernel, HostPlugin, HostPluginStats, KernelLaunch};

/// Per-operation asynchronous handle threaded through copies and launches.
///
/// The queue is created by the plugin on first use; the runtime only asks the
/// plugin to synchronize it before relying on the results.
#[derive(Default)]
pub struct AsyncInfo {
    queue: Option<Box<dyn Any + Send>>,
}

impl AsyncInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_none()
    }

    /// Plugin-owned queue state, created with `init` when absent.
    pub fn queue_or_insert_with<T, F>(&mut self, init: F) -> Option<&mut T>
    where
        T: Any + Send,
        F: FnOnce() -> T,
    {
        self.queue
            .get_or_insert_with(|| Box::new(init()))
            .downcast_mut::<T>()
    }

    pub fn take_queue<T: Any + Send>(&mut self) -> Option<Box<T>> {
        let queue = self.queue.take()?;
        match queue.downcast::<T>() {
            Ok(q) => Some(q),
            Err(other) => {
                self.queue = Some(other);
                None
            }
        }
    }
}

impl std::fmt::Debug for AsyncInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncInfo")
            .field("pending", &self.queue.is_some())
            .finish()
    }
}

/// Device-side view of one offload entry inside an image.
#[derive(Clone, Debug, Default)]
pub struct ImageEntry {
    pub name: String,
    /// Zero for functions, byte size for globals.
    pub size: usize,
    pub flags: EntryFlags,
    /// Initial contents of a global.
    pub init: Vec<u8>,
}

/// A device image embedded in a host binary.
#[derive(Clone, Debug, Default)]
pub struct DeviceImage {
    pub triple: String,
    pub bytes: Vec<u8>,
    pub entries: Vec<ImageEntry>,
}

/// Host-side offload entry: a target region's host stub or a declare-target global.
#[derive(Clone, Debug)]
pub struct HostEntry {
    pub name: String,
    pub addr: HostAddress,
    pub size: usize,
    pub flags: EntryFlags,
}

impl HostEntry {
    pub fn is_global(&self) -> bool {
        self.size != 0
    }
}

/// Device counterpart of a `HostEntry`, produced by loading an image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetEntry {
    pub name: String,
    pub addr: DeviceAddress,
    pub size: usize,
}

/// Entries of a loaded image, in the same order as the host entry table.
#[derive(Clone, Debug, Default)]
pub struct TargetTable {
    pub entries: Vec<TargetEntry>,
}

/// Everything one host library registers: its device images and the host
/// entry table they all share.
#[derive(Clone, Debug, Default)]
pub struct BinaryDescriptor {
    pub images: Vec<DeviceImage>,
    pub host_entries: Vec<HostEntry>,
}

/// The operations the runtime consumes from a device backend.
pub trait DevicePlugin: Send + Sync {
    fn name(&self) -> &str;

    fn number_of_devices(&self) -> usize;

    fn is_valid_binary(&self, image: &DeviceImage) -> bool;

    fn init_device(&self, device: usize) -> Result<()>;

    /// Hands the program's `requires` clauses to the plugin; returns what the
    /// plugin can honor.
    fn init_requires(&self, flags: RequiresFlags) -> RequiresFlags {
        flags
    }

    fn load_binary(&self, device: usize, image: &DeviceImage) -> Result<TargetTable>;

    /// `host` is a hint for plugins that can place data next to its host copy.
    fn data_alloc(&self, device: usize, size: usize, host: HostAddress) -> Result<DeviceAddress>;

    fn data_delete(&self, device: usize, ptr: DeviceAddress) -> Result<()>;

    /// Copies `src` to device memory. The bytes are consumed before the call
    /// returns even when the copy itself is asynchronous.
    fn data_submit(
        &self,
        device: usize,
        dst: DeviceAddress,
        src: &[u8],
        async_info: Option<&mut AsyncInfo>,
    ) -> Result<()>;

    /// Copies `size` bytes of device memory to `dst`.
    ///
    /// # Safety
    /// `dst` must be writable for `size` bytes until the copy has completed,
    /// which for an asynchronous copy means until `synchronize` returns.
    unsafe fn data_retrieve(
        &self,
        device: usize,
        dst: HostAddress,
        src: DeviceAddress,
        size: usize,
        async_info: Option<&mut AsyncInfo>,
    ) -> Result<()>;

    fn run_region(
        &self,
        device: usize,
        entry: DeviceAddress,
        args: &[DeviceAddress],
        offsets: &[isize],
        async_info: Option<&mut AsyncInfo>,
    ) -> Result<()> {
        self.run_team_region(device, entry, args, offsets, 1, 1, 0, async_info)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_team_region(
        &self,
        device: usize,
        entry: DeviceAddress,
        args: &[DeviceAddress],
        offsets: &[isize],
        team_count: i32,
        thread_limit: i32,
        loop_trip_count: u64,
        async_info: Option<&mut AsyncInfo>,
    ) -> Result<()>;

    fn synchronize(&self, device: usize, async_info: &mut AsyncInfo) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn async_info_keeps_plugin_queue() {
        let mut info = AsyncInfo::new();
        assert!(info.is_empty());
        *info.queue_or_insert_with(|| 0u32).unwrap() += 3;
        assert_eq!(*info.queue_or_insert_with(|| 0u32).unwrap(), 3);
        assert!(info.take_queue::<String>().is_none());
        assert!(!info.is_empty());
        assert_eq!(*info.take_queue::<u32>().unwrap(), 3);
        assert!(info.is_empty());
    }
}
