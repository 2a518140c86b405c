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

#![allow(dead_code)]

use std::sync::Arc;

use offload_core::plugin::{HOST_TRIPLE, HostKernel};
use offload_core::{
    BinaryDescriptor, DeviceImage, EntryFlags, HostAddress, HostEntry, HostPlugin, ImageEntry,
    LibraryId, OffloadRuntime, RuntimeConfig,
};

pub fn host_runtime(devices: usize) -> (OffloadRuntime, Arc<HostPlugin>) {
    OffloadRuntime::with_host_plugin(RuntimeConfig {
        host_devices: devices,
        ..Default::default()
    })
    .unwrap()
}

/// One offload entry of a test library.
pub enum Entry {
    Kernel {
        name: &'static str,
        stub: HostAddress,
        flags: EntryFlags,
        kernel: HostKernel,
    },
    Global {
        name: &'static str,
        host: HostAddress,
        init: Vec<u8>,
    },
}

impl Entry {
    pub fn kernel(name: &'static str, stub: HostAddress, kernel: HostKernel) -> Self {
        Entry::Kernel {
            name,
            stub,
            flags: EntryFlags::empty(),
            kernel,
        }
    }
}

/// Registers the kernels on the host plugin and the library on the runtime.
pub fn register(rt: &OffloadRuntime, plugin: &HostPlugin, entries: Vec<Entry>) -> LibraryId {
    let mut host_entries = Vec::new();
    let mut image_entries = Vec::new();
    for entry in entries {
        match entry {
            Entry::Kernel {
                name,
                stub,
                flags,
                kernel,
            } => {
                plugin.register_kernel(name, kernel).unwrap();
                host_entries.push(HostEntry {
                    name: name.to_string(),
                    addr: stub,
                    size: 0,
                    flags,
                });
                image_entries.push(ImageEntry {
                    name: name.to_string(),
                    flags,
                    ..Default::default()
                });
            }
            Entry::Global { name, host, init } => {
                host_entries.push(HostEntry {
                    name: name.to_string(),
                    addr: host,
                    size: init.len(),
                    flags: EntryFlags::empty(),
                });
                image_entries.push(ImageEntry {
                    name: name.to_string(),
                    size: init.len(),
                    init,
                    ..Default::default()
                });
            }
        }
    }
    rt.register_library(BinaryDescriptor {
        images: vec![DeviceImage {
            triple: HOST_TRIPLE.to_string(),
            bytes: Vec::new(),
            entries: image_entries,
        }],
        host_entries,
    })
    .unwrap()
}

static STUBS: [u8; 16] = [0; 16];

/// A distinct host address to stand in for the host stub of region `i`.
pub fn stub(i: usize) -> HostAddress {
    HostAddress::from_ptr(&STUBS[i] as *const u8)
}
