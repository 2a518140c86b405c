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

//! Data movement for `target data` constructs
//!
//! Arguments are processed in order on entry and in reverse order on exit, so
//! that a struct's members are always handled after (on exit, before) the
//! struct they belong to. A failing argument aborts the call; arguments that
//! were already processed stay mapped.

use crate::address::{DeviceAddress, HostAddress, POINTER_SIZE, device_base_of};
use crate::args::{self, MapArg};
use crate::device::{AllocRequest, DeviceContext, RefCount, ShadowPointer};
use crate::error::{OffloadError, Result};
use crate::map_type::MapType;
use crate::plugin::AsyncInfo;

/// Head entries of a combined struct mapping are aligned down to this.
pub const STRUCT_ALIGNMENT: usize = 8;

/// `begin`/`size` of argument `i`, widened down to `STRUCT_ALIGNMENT` when it
/// heads a combined struct entry, i.e. has no parent while the next argument
/// is its member.
fn padded_section(args: &[MapArg], i: usize) -> (HostAddress, usize) {
    let arg = &args[i];
    let is_combined_head = arg.map_type.parent_index().is_none()
        && args
            .get(i + 1)
            .is_some_and(|next| next.map_type.parent_index() == Some(i));
    if !is_combined_head {
        return (arg.begin, arg.size);
    }
    let (begin, padding) = arg.begin.align_down(STRUCT_ALIGNMENT);
    if padding != 0 {
        log::debug!(
            "using a padding of {padding} bytes for begin address {}",
            arg.begin
        );
    }
    (begin, arg.size + padding)
}

/// Whether the struct `map_type` is a member of has exactly one reference,
/// which makes this copy of the member the one that must be kept in sync.
fn parent_is_sole_owner(device: &DeviceContext, args: &[MapArg], map_type: MapType) -> Result<bool> {
    let Some(parent) = map_type.parent_index() else {
        return Ok(false);
    };
    let parent_begin = args.get(parent).map(|a| a.begin).ok_or_else(|| {
        OffloadError::InvalidInput(format!("member of argument {parent}, which does not exist"))
    })?;
    match device.ref_count(parent_begin)? {
        Some(RefCount::Finite(1)) => Ok(true),
        Some(_) => Ok(false),
        None => Err(OffloadError::InvalidInput(format!(
            "parent struct at {parent_begin} is not mapped"
        ))),
    }
}

fn is_plain_member(map_type: MapType) -> bool {
    map_type.is_member() && !map_type.contains(MapType::PTR_AND_OBJ)
}

/// Maps every argument on entry to a `target data` region or target construct.
///
/// # Safety
/// Every argument must describe readable host memory; PTR_AND_OBJ bases must
/// be valid pointer slots.
pub unsafe fn target_data_begin(
    device: &DeviceContext,
    args: &mut [MapArg],
    mut async_info: Option<&mut AsyncInfo>,
) -> Result<()> {
    crate::profile_scope!("Mapping::DataBegin");
    let usm = device.unified_shared_memory();
    for i in 0..args.len() {
        let map_type = args[i].map_type;
        if map_type.is_unmapped() {
            continue;
        }
        if let Some(mapper) = args[i].mapper.clone() {
            log::debug!("calling mapper for argument {i}");
            let mut components = args::expand(mapper.as_ref(), &args[i])?;
            unsafe { target_data_begin(device, &mut components, async_info.as_deref_mut())? };
            continue;
        }

        let (begin, size) = padded_section(args, i);
        let mut base = args[i].base;
        let implicit = map_type.contains(MapType::IMPLICIT);
        let close = map_type.contains(MapType::CLOSE);
        let present = map_type.contains(MapType::PRESENT);
        // Members share the reference of their struct.
        let mut update_ref = !map_type.is_member();

        let mut pointer_slot = None;
        if map_type.contains(MapType::PTR_AND_OBJ) {
            let slot = device
                .get_or_alloc(&AllocRequest {
                    base,
                    begin: base,
                    size: POINTER_SIZE,
                    implicit,
                    update_ref,
                    force_device: close,
                    require_present: present,
                })?
                .ok_or_else(|| {
                    log::error!(
                        "device mapping required by 'present' map type modifier does not exist for host address {base} ({POINTER_SIZE} bytes)"
                    );
                    OffloadError::NotPresent {
                        addr: base,
                        size: POINTER_SIZE,
                    }
                })?;
            log::debug!(
                "pointer slot host {base} -> device {} ({})",
                slot.device_begin,
                if slot.is_new { "new" } else { "existing" }
            );
            pointer_slot = Some((base, slot.device_begin));
            base = unsafe { base.read_pointer() };
            update_ref = true;
        }

        let mapped = device.get_or_alloc(&AllocRequest {
            base,
            begin,
            size,
            implicit,
            update_ref,
            force_device: close,
            require_present: present,
        })?;
        let (device_begin, is_new, is_host_ptr) = match mapped {
            Some(m) => (m.device_begin, m.is_new, m.is_host_ptr),
            None if present => {
                log::error!(
                    "device mapping required by 'present' map type modifier does not exist for host address {begin} ({size} bytes)"
                );
                return Err(OffloadError::NotPresent { addr: begin, size });
            }
            None if size != 0 => {
                return Err(OffloadError::Allocation {
                    size,
                    reason: format!("no device memory for host address {begin}"),
                });
            }
            // Zero-length section of a possibly null pointer.
            None => (DeviceAddress::NULL, false, false),
        };

        if map_type.contains(MapType::RETURN_PARAM) {
            let device_base = device_base_of(device_begin, begin, base);
            log::debug!("returning device pointer {device_base}");
            args[i].device_base = Some(device_base);
        }

        if map_type.contains(MapType::TO) && size != 0 && !is_host_ptr && (!usm || close) {
            let copy = is_new
                || map_type.contains(MapType::ALWAYS)
                || (map_type.is_member() && parent_is_sole_owner(device, args, map_type)?);
            if copy {
                let bytes = unsafe { begin.as_bytes(size) };
                device.submit(device_begin, bytes, async_info.as_deref_mut())?;
            }
        }

        if let Some((host_slot, device_slot)) = pointer_slot
            && !is_host_ptr
        {
            let device_value = device_base_of(device_begin, begin, base);
            log::debug!("update pointer ({device_slot}) -> [{device_value}]");
            device.submit(
                device_slot,
                &device_value.to_pointer_bytes(),
                async_info.as_deref_mut(),
            )?;
            device.record_shadow(ShadowPointer {
                host_slot,
                host_value: base,
                device_slot,
                device_value,
            })?;
        }
    }
    Ok(())
}

/// Unmaps every argument on exit, in reverse order.
///
/// # Safety
/// Every argument must describe writable host memory that stays valid until
/// the call returns.
pub unsafe fn target_data_end(
    device: &DeviceContext,
    args: &mut [MapArg],
    mut async_info: Option<&mut AsyncInfo>,
) -> Result<()> {
    crate::profile_scope!("Mapping::DataEnd");
    let usm = device.unified_shared_memory();
    for i in (0..args.len()).rev() {
        let map_type = args[i].map_type;
        if map_type.is_unmapped() {
            continue;
        }
        if let Some(mapper) = args[i].mapper.clone() {
            log::debug!("calling mapper for argument {i}");
            let mut components = args::expand(mapper.as_ref(), &args[i])?;
            unsafe { target_data_end(device, &mut components, async_info.as_deref_mut())? };
            continue;
        }

        let (begin, size) = padded_section(args, i);
        let update_ref = !map_type.is_member() || map_type.contains(MapType::PTR_AND_OBJ);
        let force_delete = map_type.contains(MapType::DELETE);
        let close = map_type.contains(MapType::CLOSE);
        let present = map_type.contains(MapType::PRESENT);

        let Some(existing) = device.lookup_existing(begin, size, update_ref)? else {
            if present {
                log::error!(
                    "device mapping required by 'present' map type modifier does not exist for host address {begin} ({size} bytes)"
                );
                return Err(OffloadError::NotPresent { addr: begin, size });
            }
            log::debug!("host {begin} ({size} bytes) is not mapped, nothing to release");
            continue;
        };
        log::debug!(
            "{size} bytes mapped at device {} - is{} last",
            existing.device_begin,
            if existing.is_last { "" } else { " not" }
        );

        // A member never takes its struct down with it.
        let del_entry = (existing.is_last || force_delete) && !is_plain_member(map_type);
        let from = map_type.contains(MapType::FROM);
        if !from && !del_entry {
            continue;
        }

        let mut copied = false;
        if from {
            let copy_member = (!usm || close)
                && is_plain_member(map_type)
                && parent_is_sole_owner(device, args, map_type)?;
            let self_copy = usm && existing.device_begin.is_same_as_host(begin);
            if (del_entry || map_type.contains(MapType::ALWAYS) || copy_member)
                && !self_copy
                && size != 0
            {
                unsafe {
                    device.retrieve(begin, existing.device_begin, size, async_info.as_deref_mut())?
                };
                copied = true;
            }
        }

        let end = begin.add(size);
        let shadows = if del_entry {
            device.take_shadows_in_range(begin, end)?
        } else {
            device.shadows_in_range(begin, end)?
        };
        if from && !shadows.is_empty() {
            if copied && let Some(info) = async_info.as_deref_mut() {
                device.synchronize(info)?;
            }
            for shadow in &shadows {
                log::debug!(
                    "restoring original host pointer value {} for host pointer {}",
                    shadow.host_value,
                    shadow.host_slot
                );
                unsafe { shadow.restore_host() };
            }
        }

        if del_entry {
            device.release(begin, size, force_delete, close)?;
        }
    }
    Ok(())
}

/// Refreshes mapped sections in either direction without touching reference
/// counts. Unmapped sections are skipped unless `present` is requested.
///
/// # Safety
/// Every argument must describe valid host memory, writable for FROM.
pub unsafe fn target_data_update(
    device: &DeviceContext,
    args: &mut [MapArg],
    mut async_info: Option<&mut AsyncInfo>,
) -> Result<()> {
    crate::profile_scope!("Mapping::DataUpdate");
    let usm = device.unified_shared_memory();
    for i in 0..args.len() {
        let map_type = args[i].map_type;
        if map_type.is_unmapped() {
            continue;
        }
        if let Some(mapper) = args[i].mapper.clone() {
            log::debug!("calling mapper for argument {i}");
            let mut components = args::expand(mapper.as_ref(), &args[i])?;
            unsafe { target_data_update(device, &mut components, async_info.as_deref_mut())? };
            continue;
        }

        let begin = args[i].begin;
        let size = args[i].size;
        let Some(existing) = device.lookup_existing(begin, size, false)? else {
            if map_type.contains(MapType::PRESENT) {
                log::error!(
                    "device mapping required by 'present' motion modifier does not exist for host address {begin} ({size} bytes)"
                );
                return Err(OffloadError::NotPresent { addr: begin, size });
            }
            log::debug!("host {begin} not found, update becomes a noop");
            continue;
        };
        if usm && existing.device_begin.is_same_as_host(begin) {
            log::debug!("host {begin} is unified and shared, update becomes a noop");
            continue;
        }
        let end = begin.add(size);

        if map_type.contains(MapType::FROM) {
            unsafe {
                device.retrieve(begin, existing.device_begin, size, async_info.as_deref_mut())?
            };
            let shadows = device.shadows_in_range(begin, end)?;
            if !shadows.is_empty() {
                if let Some(info) = async_info.as_deref_mut() {
                    device.synchronize(info)?;
                }
                for shadow in &shadows {
                    unsafe { shadow.restore_host() };
                }
            }
        }

        if map_type.contains(MapType::TO) {
            let bytes = unsafe { begin.as_bytes(size) };
            device.submit(existing.device_begin, bytes, async_info.as_deref_mut())?;
            for shadow in device.shadows_in_range(begin, end)? {
                log::debug!(
                    "restoring original target pointer value {} for target pointer {}",
                    shadow.device_value,
                    shadow.device_slot
                );
                device.submit(
                    shadow.device_slot,
                    &shadow.device_value.to_pointer_bytes(),
                    async_info.as_deref_mut(),
                )?;
            }
        }
    }
    Ok(())
}
