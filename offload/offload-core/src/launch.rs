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

//! Target region launch: map, rebase arguments, run, unmap.

use crate::address::{DeviceAddress, HostAddress, POINTER_SIZE};
use crate::args::MapArg;
use crate::device::DeviceContext;
use crate::error::{OffloadError, Result};
use crate::map_type::MapType;
use crate::mapping::{target_data_begin, target_data_end};
use crate::plugin::AsyncInfo;
use crate::registry::ImageRegistry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaunchKind {
    /// `target`: one team, one thread.
    Single,
    /// `target teams`.
    Teams { team_count: i32, thread_limit: i32 },
}

/// Device arguments of one launch, parallel to the kernel's parameter list.
#[derive(Debug, Default)]
struct KernelArgs {
    args: Vec<DeviceAddress>,
    offsets: Vec<isize>,
    /// Position in `args` of each host argument that became a parameter.
    positions: Vec<Option<usize>>,
}

impl KernelArgs {
    fn push(&mut self, host_index: usize, arg: DeviceAddress, offset: isize) {
        self.positions[host_index] = Some(self.args.len());
        self.args.push(arg);
        self.offsets.push(offset);
    }
}

/// Scratch buffers for private arguments; they live for one launch only.
struct PrivateBuffers<'a> {
    device: &'a DeviceContext,
    buffers: Vec<DeviceAddress>,
}

impl<'a> PrivateBuffers<'a> {
    fn new(device: &'a DeviceContext) -> Self {
        Self {
            device,
            buffers: Vec::new(),
        }
    }

    fn free_all(mut self) -> Result<()> {
        for ptr in std::mem::take(&mut self.buffers) {
            self.device.delete_data(ptr)?;
        }
        Ok(())
    }
}

impl Drop for PrivateBuffers<'_> {
    fn drop(&mut self) {
        for ptr in self.buffers.drain(..) {
            if let Err(e) = self.device.delete_data(ptr) {
                log::warn!("failed to free private buffer {ptr}: {e}");
            }
        }
    }
}

/// Points the device copy of a lambda's captured pointer at the captured
/// variable's device copy. The lambda object itself was pushed earlier as
/// its parent argument.
fn patch_lambda_capture(
    device: &DeviceContext,
    args: &[MapArg],
    built: &KernelArgs,
    i: usize,
    async_info: &mut AsyncInfo,
) -> Result<()> {
    let arg = &args[i];
    let parent = arg.map_type.parent_index().ok_or_else(|| {
        OffloadError::InvalidInput(format!("lambda capture {i} is not a member of its lambda"))
    })?;
    let position = built
        .positions
        .get(parent)
        .copied()
        .flatten()
        .ok_or_else(|| {
            OffloadError::InvalidInput(format!(
                "lambda {parent} must be translated before its capture {i}"
            ))
        })?;
    let lambda_device_base = built.args[position].offset(built.offsets[position]);
    // For captures the base is the slot inside the lambda and begin the captured value.
    let capture_slot = arg.base;
    let lambda_host_base = args[parent].begin;
    let device_slot = lambda_device_base.offset(capture_slot.delta_from(lambda_host_base));

    let Some(captured) = device.lookup_existing(arg.begin, arg.size, false)? else {
        log::debug!("no lambda captured variable mapped ({}) - ignored", arg.begin);
        return Ok(());
    };
    if device.unified_shared_memory() && device_slot.is_same_as_host(capture_slot) {
        log::debug!("unified memory is active, no need to map lambda captured variable");
        return Ok(());
    }
    log::debug!(
        "update lambda reference ({}) -> [{device_slot}]",
        captured.device_begin
    );
    device.submit(
        device_slot,
        &captured.device_begin.to_pointer_bytes(),
        Some(async_info),
    )
}

/// Builds the device argument vector after all arguments were mapped.
///
/// # Safety
/// First-private arguments must describe readable host memory.
unsafe fn build_kernel_args(
    device: &DeviceContext,
    args: &[MapArg],
    privates: &mut PrivateBuffers<'_>,
    async_info: &mut AsyncInfo,
) -> Result<KernelArgs> {
    let mut built = KernelArgs {
        positions: vec![None; args.len()],
        ..Default::default()
    };
    for (i, arg) in args.iter().enumerate() {
        let map_type = arg.map_type;
        if !map_type.contains(MapType::TARGET_PARAM) {
            if map_type.is_lambda_capture() {
                patch_lambda_capture(device, args, &built, i, async_info)?;
            }
            continue;
        }
        if map_type.contains(MapType::LITERAL) {
            log::debug!("forwarding first-private value {} to the target construct", arg.base);
            // By-value arguments travel in the pointer slot unchanged.
            built.push(i, DeviceAddress::unified(arg.base), 0);
        } else if map_type.contains(MapType::PRIVATE) {
            let buffer = device.alloc_data(arg.size, arg.begin)?;
            privates.buffers.push(buffer);
            let first_private = map_type.contains(MapType::TO);
            log::debug!(
                "allocated {} bytes at {buffer} for {}private array {}",
                arg.size,
                if first_private { "first-" } else { "" },
                arg.begin
            );
            if first_private && arg.size != 0 {
                let bytes = unsafe { arg.begin.as_bytes(arg.size) };
                device.submit(buffer, bytes, Some(&mut *async_info))?;
            }
            built.push(i, buffer, arg.base.delta_from(arg.begin));
        } else if map_type.contains(MapType::PTR_AND_OBJ) {
            let slot = device
                .lookup_existing(arg.base, POINTER_SIZE, false)?
                .map(|e| e.device_begin)
                .unwrap_or(DeviceAddress::NULL);
            log::debug!("obtained target argument {slot} from host pointer {}", arg.base);
            built.push(i, slot, 0);
        } else {
            let begin = device
                .lookup_existing(arg.begin, arg.size, false)?
                .map(|e| e.device_begin)
                .unwrap_or(DeviceAddress::NULL);
            let offset = arg.base.delta_from(arg.begin);
            log::debug!(
                "obtained target argument {} from host pointer {}",
                begin.offset(offset),
                arg.begin
            );
            built.push(i, begin, offset);
        }
    }
    Ok(built)
}

fn run(
    device: &DeviceContext,
    entry: DeviceAddress,
    built: &KernelArgs,
    kind: LaunchKind,
    loop_trip_count: u64,
    async_info: &mut AsyncInfo,
) -> Result<()> {
    let plugin = device.plugin();
    match kind {
        LaunchKind::Single => plugin.run_region(
            device.local_id(),
            entry,
            &built.args,
            &built.offsets,
            Some(async_info),
        ),
        LaunchKind::Teams {
            team_count,
            thread_limit,
        } => plugin.run_team_region(
            device.local_id(),
            entry,
            &built.args,
            &built.offsets,
            team_count,
            thread_limit,
            loop_trip_count,
            Some(async_info),
        ),
    }
}

/// Runs the target region whose host stub is `host_entry` on `device`.
///
/// Mappings made before a failure are left in place.
///
/// # Safety
/// The arguments must describe valid host memory for the whole call, as for
/// `target_data_begin` and `target_data_end`.
pub unsafe fn target(
    device: &DeviceContext,
    registry: &ImageRegistry,
    host_entry: HostAddress,
    args: &mut [MapArg],
    kind: LaunchKind,
) -> Result<()> {
    crate::profile_scope!("Launch::Target");
    let entry = registry.resolve(host_entry, device.id())?;
    let mut async_info = AsyncInfo::new();

    unsafe { target_data_begin(device, args, Some(&mut async_info))? };

    let mut privates = PrivateBuffers::new(device);
    let built = unsafe { build_kernel_args(device, args, &mut privates, &mut async_info)? };

    let loop_trip_count = device.take_loop_trip_count(std::thread::current().id())?;
    if loop_trip_count != 0 {
        log::debug!("loop trip count is {loop_trip_count}");
    }
    log::debug!(
        "launching target execution {entry} for host {host_entry} with {} arguments",
        built.args.len()
    );
    run(device, entry, &built, kind, loop_trip_count, &mut async_info)?;

    // Private buffers may still be in use by the launch.
    device.synchronize(&mut async_info)?;
    privates.free_all()?;

    unsafe { target_data_end(device, args, Some(&mut async_info))? };
    device.synchronize(&mut async_info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_args_track_positions() {
        let mut built = KernelArgs {
            positions: vec![None; 3],
            ..Default::default()
        };
        built.push(0, DeviceAddress::new(0x100), 0);
        built.push(2, DeviceAddress::new(0x200), -8);
        assert_eq!(built.positions, vec![Some(0), None, Some(1)]);
        assert_eq!(built.offsets, vec![0, -8]);
    }
}
