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

//! Host plugin: a device whose memory is host heap memory.
//!
//! "Device" buffers are 256-byte aligned heap allocations, copies are plain
//! memcpys and kernels are Rust closures registered by entry name. Every
//! buffer handed out is tracked, so copies that stray outside a live
//! allocation are reported instead of corrupting the heap.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::address::{DeviceAddress, HostAddress};
use crate::error::{OffloadError, Result, lock, read, write};
use crate::plugin::worker::{DeviceWorker, HostStream, Job};
use crate::plugin::{AsyncInfo, DeviceImage, DevicePlugin, TargetEntry, TargetTable};

/// Target triple of images this plugin accepts.
pub const HOST_TRIPLE: &str = "offload-host";

const DEVICE_ALIGNMENT: usize = 256;

/// Kernel entry addresses live above the canonical user address range so they
/// can never alias a real allocation.
const KERNEL_TOKEN_BASE: u64 = 0xf000_0000_0000_0000;

/// Arguments a host kernel receives: rebased device addresses plus launch geometry.
#[derive(Debug)]
pub struct KernelLaunch<'a> {
    pub args: &'a [usize],
    pub team_count: i32,
    pub thread_limit: i32,
    pub loop_trip_count: u64,
}

impl KernelLaunch<'_> {
    /// Argument `i` as a typed pointer.
    pub fn arg_ptr<T>(&self, i: usize) -> Result<*mut T> {
        self.args
            .get(i)
            .map(|a| *a as *mut T)
            .ok_or_else(|| {
                OffloadError::KernelLaunch(format!(
                    "kernel expects argument {i}, got {}",
                    self.args.len()
                ))
            })
    }
}

pub type HostKernel = Arc<dyn Fn(&KernelLaunch<'_>) -> Result<()> + Send + Sync>;

/// Snapshot of the plugin's activity counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostPluginStats {
    pub allocations: u64,
    pub frees: u64,
    pub bytes_submitted: u64,
    pub bytes_retrieved: u64,
    pub launches: u64,
}

#[derive(Default)]
struct Counters {
    allocations: AtomicU64,
    frees: AtomicU64,
    bytes_submitted: AtomicU64,
    bytes_retrieved: AtomicU64,
    launches: AtomicU64,
}

#[derive(Default)]
struct HostDevice {
    initialized: bool,
    allocations: BTreeMap<u64, Layout>,
}

impl HostDevice {
    fn check_range(&self, addr: DeviceAddress, size: usize) -> Result<()> {
        let a = addr.as_u64();
        let inside = self
            .allocations
            .range(..=a)
            .next_back()
            .is_some_and(|(start, layout)| a + size as u64 <= start + layout.size() as u64);
        if inside {
            Ok(())
        } else {
            Err(OffloadError::Transfer(format!(
                "device range {addr} ({size} bytes) is outside any live allocation"
            )))
        }
    }
}

pub struct HostPlugin {
    queue_capacity: usize,
    devices: Vec<Mutex<HostDevice>>,
    workers: Vec<OnceLock<DeviceWorker>>,
    kernels: RwLock<HashMap<String, HostKernel>>,
    loaded_kernels: RwLock<HashMap<u64, HostKernel>>,
    next_token: AtomicU64,
    counters: Counters,
}

impl HostPlugin {
    pub fn new(num_devices: usize, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            devices: (0..num_devices).map(|_| Mutex::default()).collect(),
            workers: (0..num_devices).map(|_| OnceLock::new()).collect(),
            kernels: RwLock::default(),
            loaded_kernels: RwLock::default(),
            next_token: AtomicU64::new(KERNEL_TOKEN_BASE),
            counters: Counters::default(),
        }
    }

    /// Makes `kernel` available to images that carry an entry named `name`.
    pub fn register_kernel(&self, name: impl Into<String>, kernel: HostKernel) -> Result<()> {
        let name = name.into();
        log::debug!("host plugin: registered kernel '{name}'");
        write(&self.kernels, "host kernel registry")?.insert(name, kernel);
        Ok(())
    }

    pub fn stats(&self) -> HostPluginStats {
        HostPluginStats {
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            frees: self.counters.frees.load(Ordering::Relaxed),
            bytes_submitted: self.counters.bytes_submitted.load(Ordering::Relaxed),
            bytes_retrieved: self.counters.bytes_retrieved.load(Ordering::Relaxed),
            launches: self.counters.launches.load(Ordering::Relaxed),
        }
    }

    /// Buffers currently allocated on `device`, globals included.
    pub fn live_allocations(&self, device: usize) -> Result<usize> {
        Ok(self.device(device)?.allocations.len())
    }

    fn device(&self, device: usize) -> Result<std::sync::MutexGuard<'_, HostDevice>> {
        let slot = self
            .devices
            .get(device)
            .ok_or_else(|| OffloadError::Plugin(format!("host device {device} does not exist")))?;
        let guard = lock(slot, "host device")?;
        if !guard.initialized {
            return Err(OffloadError::Plugin(format!(
                "host device {device} is not initialized"
            )));
        }
        Ok(guard)
    }

    fn worker(&self, device: usize) -> Result<&DeviceWorker> {
        let slot = self
            .workers
            .get(device)
            .ok_or_else(|| OffloadError::Plugin(format!("host device {device} does not exist")))?;
        if let Some(worker) = slot.get() {
            return Ok(worker);
        }
        let worker = DeviceWorker::spawn(device, self.queue_capacity)?;
        // A racing thread may have won; its worker is kept and ours is dropped.
        Ok(slot.get_or_init(|| worker))
    }

    fn enqueue(&self, device: usize, async_info: &mut AsyncInfo, job: Job) -> Result<()> {
        let done = self.worker(device)?.enqueue(job)?;
        async_info
            .queue_or_insert_with(HostStream::default)
            .ok_or_else(|| {
                OffloadError::Plugin("async handle belongs to another plugin".to_string())
            })?
            .push(done);
        Ok(())
    }

    fn allocate(&self, device: usize, size: usize) -> Result<DeviceAddress> {
        let layout = Layout::from_size_align(size.max(1), DEVICE_ALIGNMENT).map_err(|e| {
            OffloadError::Allocation {
                size,
                reason: e.to_string(),
            }
        })?;
        let mut dev = self.device(device)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(OffloadError::Allocation {
                size,
                reason: "host heap exhausted".to_string(),
            });
        }
        dev.allocations.insert(ptr as u64, layout);
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(DeviceAddress::new(ptr as u64))
    }

    fn kernel_for(&self, entry: DeviceAddress) -> Result<HostKernel> {
        read(&self.loaded_kernels, "host kernel table")?
            .get(&entry.as_u64())
            .cloned()
            .ok_or_else(|| {
                OffloadError::KernelLaunch(format!("no kernel loaded at entry {entry}"))
            })
    }
}

impl Drop for HostPlugin {
    fn drop(&mut self) {
        // Workers may still hold copies into device buffers.
        self.workers.clear();
        for slot in &self.devices {
            if let Ok(mut dev) = slot.lock() {
                for (addr, layout) in std::mem::take(&mut dev.allocations) {
                    unsafe { dealloc(addr as *mut u8, layout) };
                }
            }
        }
    }
}

impl DevicePlugin for HostPlugin {
    fn name(&self) -> &str {
        "host"
    }

    fn number_of_devices(&self) -> usize {
        self.devices.len()
    }

    fn is_valid_binary(&self, image: &DeviceImage) -> bool {
        image.triple == HOST_TRIPLE
    }

    fn init_device(&self, device: usize) -> Result<()> {
        let slot = self
            .devices
            .get(device)
            .ok_or_else(|| OffloadError::Plugin(format!("host device {device} does not exist")))?;
        lock(slot, "host device")?.initialized = true;
        log::debug!("host plugin: initialized device {device}");
        Ok(())
    }

    fn load_binary(&self, device: usize, image: &DeviceImage) -> Result<TargetTable> {
        crate::profile_scope!("HostPlugin::LoadBinary");
        let mut entries = Vec::with_capacity(image.entries.len());
        for entry in &image.entries {
            let addr = if entry.size == 0 {
                let kernel = read(&self.kernels, "host kernel registry")?
                    .get(&entry.name)
                    .cloned()
                    .ok_or_else(|| {
                        OffloadError::ImageLoad(format!(
                            "no host kernel registered for entry '{}'",
                            entry.name
                        ))
                    })?;
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                write(&self.loaded_kernels, "host kernel table")?.insert(token, kernel);
                DeviceAddress::new(token)
            } else {
                let addr = self.allocate(device, entry.size)?;
                let n = entry.init.len().min(entry.size);
                if n > 0 {
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            entry.init.as_ptr(),
                            addr.as_u64() as *mut u8,
                            n,
                        );
                    }
                }
                addr
            };
            log::debug!(
                "host plugin: device {device} entry '{}' ({} bytes) at {addr}",
                entry.name,
                entry.size
            );
            entries.push(TargetEntry {
                name: entry.name.clone(),
                addr,
                size: entry.size,
            });
        }
        Ok(TargetTable { entries })
    }

    fn data_alloc(&self, device: usize, size: usize, _host: HostAddress) -> Result<DeviceAddress> {
        self.allocate(device, size)
    }

    fn data_delete(&self, device: usize, ptr: DeviceAddress) -> Result<()> {
        // Frees are ordered after queued copies and launches.
        if let Some(worker) = self.workers.get(device).and_then(OnceLock::get) {
            worker.drain()?;
        }
        let mut dev = self.device(device)?;
        let layout = dev.allocations.remove(&ptr.as_u64()).ok_or_else(|| {
            OffloadError::Plugin(format!("{ptr} is not a live allocation on device {device}"))
        })?;
        unsafe { dealloc(ptr.as_u64() as *mut u8, layout) };
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn data_submit(
        &self,
        device: usize,
        dst: DeviceAddress,
        src: &[u8],
        async_info: Option<&mut AsyncInfo>,
    ) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.device(device)?.check_range(dst, src.len())?;
        self.counters
            .bytes_submitted
            .fetch_add(src.len() as u64, Ordering::Relaxed);
        let dst = dst.as_u64() as usize;
        match async_info {
            Some(info) => {
                let staged = src.to_vec();
                self.enqueue(
                    device,
                    info,
                    Box::new(move || {
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                staged.as_ptr(),
                                dst as *mut u8,
                                staged.len(),
                            )
                        };
                        Ok(())
                    }),
                )
            }
            None => {
                unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len()) };
                Ok(())
            }
        }
    }

    unsafe fn data_retrieve(
        &self,
        device: usize,
        dst: HostAddress,
        src: DeviceAddress,
        size: usize,
        async_info: Option<&mut AsyncInfo>,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.device(device)?.check_range(src, size)?;
        self.counters
            .bytes_retrieved
            .fetch_add(size as u64, Ordering::Relaxed);
        let src = src.as_u64() as usize;
        let dst = dst.as_usize();
        let copy = move || {
            unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, size) };
            Ok(())
        };
        match async_info {
            Some(info) => self.enqueue(device, info, Box::new(copy)),
            None => copy(),
        }
    }

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
    ) -> Result<()> {
        if args.len() != offsets.len() {
            return Err(OffloadError::KernelLaunch(format!(
                "{} arguments but {} offsets",
                args.len(),
                offsets.len()
            )));
        }
        drop(self.device(device)?);
        let kernel = self.kernel_for(entry)?;
        let rebased: Vec<usize> = args
            .iter()
            .zip(offsets)
            .map(|(a, o)| a.offset(*o).as_u64() as usize)
            .collect();
        self.counters.launches.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "host plugin: launching {entry} on device {device} with {} args, {team_count} teams, \
             thread limit {thread_limit}, trip count {loop_trip_count}",
            rebased.len()
        );
        let run = move || {
            kernel(&KernelLaunch {
                args: &rebased,
                team_count,
                thread_limit,
                loop_trip_count,
            })
        };
        match async_info {
            Some(info) => self.enqueue(device, info, Box::new(run)),
            None => run(),
        }
    }

    fn synchronize(&self, _device: usize, async_info: &mut AsyncInfo) -> Result<()> {
        match async_info.take_queue::<HostStream>() {
            Some(mut stream) => stream.wait(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_type::EntryFlags;
    use crate::plugin::ImageEntry;

    fn plugin() -> HostPlugin {
        let p = HostPlugin::new(2, 4);
        p.init_device(0).unwrap();
        p
    }

    #[test]
    fn alloc_is_aligned_and_tracked() {
        let p = plugin();
        let a = p.data_alloc(0, 100, HostAddress::NULL).unwrap();
        assert_eq!(a.as_u64() % DEVICE_ALIGNMENT as u64, 0);
        assert_eq!(p.live_allocations(0).unwrap(), 1);
        p.data_delete(0, a).unwrap();
        assert_eq!(p.live_allocations(0).unwrap(), 0);
        assert!(p.data_delete(0, a).is_err());
    }

    #[test]
    fn uninitialized_device_is_rejected() {
        let p = plugin();
        assert!(p.data_alloc(1, 8, HostAddress::NULL).is_err());
        assert!(p.data_alloc(5, 8, HostAddress::NULL).is_err());
    }

    #[test]
    fn submit_and_retrieve_roundtrip() {
        let p = plugin();
        let dev = p.data_alloc(0, 16, HostAddress::NULL).unwrap();
        let src: Vec<u8> = (0..16).collect();
        p.data_submit(0, dev, &src, None).unwrap();
        let mut out = [0u8; 16];
        unsafe {
            p.data_retrieve(0, HostAddress::from_mut_ptr(out.as_mut_ptr()), dev, 16, None)
                .unwrap();
        }
        assert_eq!(&out[..], &src[..]);
        assert_eq!(p.stats().bytes_submitted, 16);
        assert_eq!(p.stats().bytes_retrieved, 16);
    }

    #[test]
    fn out_of_bounds_copy_fails() {
        let p = plugin();
        let dev = p.data_alloc(0, 8, HostAddress::NULL).unwrap();
        let err = p.data_submit(0, dev.add(4), &[0u8; 8], None).unwrap_err();
        assert!(matches!(err, OffloadError::Transfer(_)));
    }

    #[test]
    fn async_copies_complete_on_synchronize() {
        let p = plugin();
        let dev = p.data_alloc(0, 4, HostAddress::NULL).unwrap();
        let mut info = AsyncInfo::new();
        p.data_submit(0, dev, &[1, 2, 3, 4], Some(&mut info)).unwrap();
        let mut out = [0u8; 4];
        unsafe {
            p.data_retrieve(
                0,
                HostAddress::from_mut_ptr(out.as_mut_ptr()),
                dev,
                4,
                Some(&mut info),
            )
            .unwrap();
        }
        p.synchronize(0, &mut info).unwrap();
        assert!(info.is_empty());
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn load_binary_resolves_kernels_and_globals() {
        let p = plugin();
        p.register_kernel(
            "add_one",
            Arc::new(|launch: &KernelLaunch<'_>| {
                let x = launch.arg_ptr::<u32>(0)?;
                unsafe { *x += 1 };
                Ok(())
            }),
        )
        .unwrap();
        let image = DeviceImage {
            triple: HOST_TRIPLE.to_string(),
            bytes: Vec::new(),
            entries: vec![
                ImageEntry {
                    name: "add_one".into(),
                    ..Default::default()
                },
                ImageEntry {
                    name: "counter".into(),
                    size: 4,
                    flags: EntryFlags::empty(),
                    init: 41u32.to_ne_bytes().to_vec(),
                },
            ],
        };
        assert!(p.is_valid_binary(&image));
        let table = p.load_binary(0, &image).unwrap();
        let kernel = table.entries[0].addr;
        let global = table.entries[1].addr;
        assert!(kernel.as_u64() >= KERNEL_TOKEN_BASE);

        p.run_region(0, kernel, &[global], &[0], None).unwrap();
        let mut out = 0u32;
        unsafe {
            p.data_retrieve(0, HostAddress::from_mut_ptr(&mut out as *mut u32), global, 4, None)
                .unwrap();
        }
        assert_eq!(out, 42);
        assert_eq!(p.stats().launches, 1);
    }

    #[test]
    fn missing_kernel_fails_load() {
        let p = plugin();
        let image = DeviceImage {
            triple: HOST_TRIPLE.to_string(),
            bytes: Vec::new(),
            entries: vec![ImageEntry {
                name: "nope".into(),
                ..Default::default()
            }],
        };
        assert!(matches!(
            p.load_binary(0, &image),
            Err(OffloadError::ImageLoad(_))
        ));
    }
}
