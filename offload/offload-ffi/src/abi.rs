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

//! C layouts emitted by the compiler and their conversion into runtime types.

use std::ffi::{CStr, c_char, c_void};
use std::sync::Arc;

use offload_core::{
    BinaryDescriptor, DeviceImage, EntryFlags, HostAddress, HostEntry, ImageEntry, MapArg, MapType,
    Mapper, MapperComponents, OffloadError, Result,
};

/// One offload entry: a region's host stub or a declare-target global.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct OffloadEntry {
    pub addr: *mut c_void,
    pub name: *const c_char,
    pub size: usize,
    pub flags: i32,
    pub reserved: i32,
}

/// A device image embedded in the host binary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DeviceImageDesc {
    pub image_start: *mut c_void,
    pub image_end: *mut c_void,
    pub entries_begin: *mut OffloadEntry,
    pub entries_end: *mut OffloadEntry,
}

/// Everything one host library registers.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BinDesc {
    pub num_device_images: i32,
    pub device_images: *mut DeviceImageDesc,
    pub host_entries_begin: *mut OffloadEntry,
    pub host_entries_end: *mut OffloadEntry,
}

/// User-defined mapper as emitted by the compiler. It reports its components
/// back through `__tgt_push_mapper_component` on `handle`.
pub type MapperFn = unsafe extern "C" fn(
    handle: *mut c_void,
    base: *mut c_void,
    begin: *mut c_void,
    size: i64,
    map_type: i64,
);

/// # Safety
/// `[begin, end)` must be a valid array of entries, or both null.
unsafe fn entry_slice<'a>(begin: *const OffloadEntry, end: *const OffloadEntry) -> &'a [OffloadEntry] {
    if begin.is_null() || end <= begin {
        return &[];
    }
    let len = unsafe { end.offset_from(begin) } as usize;
    unsafe { std::slice::from_raw_parts(begin, len) }
}

unsafe fn entry_name(entry: &OffloadEntry) -> Result<String> {
    if entry.name.is_null() {
        return Err(OffloadError::InvalidInput(format!(
            "offload entry at {:p} has no name",
            entry.addr
        )));
    }
    Ok(unsafe { CStr::from_ptr(entry.name) }
        .to_string_lossy()
        .into_owned())
}

/// Images carry their target triple as a leading NUL-terminated string.
fn image_triple(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// # Safety
/// `desc` must point to a descriptor laid out as the compiler emits it, with
/// every pointer in it valid for the duration of the call.
pub unsafe fn binary_descriptor(desc: *const BinDesc) -> Result<BinaryDescriptor> {
    let desc = unsafe { desc.as_ref() }
        .ok_or_else(|| OffloadError::InvalidInput("null binary descriptor".to_string()))?;

    let mut host_entries = Vec::new();
    for entry in unsafe { entry_slice(desc.host_entries_begin, desc.host_entries_end) } {
        host_entries.push(HostEntry {
            name: unsafe { entry_name(entry)? },
            addr: HostAddress::from_mut_ptr(entry.addr),
            size: entry.size,
            flags: EntryFlags::from_bits_retain(entry.flags),
        });
    }

    let image_count = usize::try_from(desc.num_device_images).unwrap_or(0);
    let images_raw: &[DeviceImageDesc] = if image_count == 0 || desc.device_images.is_null() {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(desc.device_images, image_count) }
    };
    let mut images = Vec::with_capacity(images_raw.len());
    for image in images_raw {
        let start = image.image_start as *const u8;
        let end = image.image_end as *const u8;
        let bytes = if start.is_null() || end <= start {
            Vec::new()
        } else {
            let len = unsafe { end.offset_from(start) } as usize;
            unsafe { std::slice::from_raw_parts(start, len) }.to_vec()
        };
        let mut entries = Vec::new();
        for entry in unsafe { entry_slice(image.entries_begin, image.entries_end) } {
            let init = if entry.size != 0 && !entry.addr.is_null() {
                unsafe { std::slice::from_raw_parts(entry.addr as *const u8, entry.size) }.to_vec()
            } else {
                Vec::new()
            };
            entries.push(ImageEntry {
                name: unsafe { entry_name(entry)? },
                size: entry.size,
                flags: EntryFlags::from_bits_retain(entry.flags),
                init,
            });
        }
        images.push(DeviceImage {
            triple: image_triple(&bytes),
            bytes,
            entries,
        });
    }
    Ok(BinaryDescriptor {
        images,
        host_entries,
    })
}

pub struct ExternMapper(MapperFn);

impl Mapper for ExternMapper {
    fn map(&self, arg: &MapArg, components: &mut MapperComponents) -> Result<()> {
        let handle = components as *mut MapperComponents as *mut c_void;
        unsafe {
            (self.0)(
                handle,
                arg.base.as_mut_ptr(),
                arg.begin.as_mut_ptr(),
                arg.size as i64,
                arg.map_type.to_raw(),
            )
        };
        Ok(())
    }
}

/// The four (five with mappers) parallel argument arrays of a construct.
#[derive(Clone, Copy)]
pub struct RawArgs {
    pub arg_num: i32,
    pub args_base: *mut *mut c_void,
    pub args: *mut *mut c_void,
    pub arg_sizes: *mut i64,
    pub arg_types: *mut i64,
    pub arg_mappers: *mut *mut c_void,
}

impl RawArgs {
    /// # Safety
    /// Every non-null array must hold `arg_num` elements; mapper entries must
    /// be null or `MapperFn`s.
    pub unsafe fn to_map_args(&self) -> Result<Vec<MapArg>> {
        let n = usize::try_from(self.arg_num)
            .map_err(|_| OffloadError::InvalidInput(format!("arg_num {}", self.arg_num)))?;
        if n == 0 {
            return Ok(Vec::new());
        }
        if self.args_base.is_null()
            || self.args.is_null()
            || self.arg_sizes.is_null()
            || self.arg_types.is_null()
        {
            return Err(OffloadError::InvalidInput(
                "null argument array for a non-empty construct".to_string(),
            ));
        }
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let (base, begin, size, map_type) = unsafe {
                (
                    *self.args_base.add(i),
                    *self.args.add(i),
                    *self.arg_sizes.add(i),
                    *self.arg_types.add(i),
                )
            };
            let mut arg = MapArg::new(
                HostAddress::from_mut_ptr(base),
                HostAddress::from_mut_ptr(begin),
                usize::try_from(size).unwrap_or(0),
                MapType::from_raw(map_type),
            );
            if !self.arg_mappers.is_null() {
                let mapper = unsafe { *self.arg_mappers.add(i) };
                if !mapper.is_null() {
                    let f: MapperFn = unsafe { std::mem::transmute(mapper) };
                    arg = arg.with_mapper(Arc::new(ExternMapper(f)));
                }
            }
            out.push(arg);
        }
        Ok(out)
    }

    /// Hands RETURN_PARAM device addresses back through `args_base`.
    ///
    /// # Safety
    /// `args_base` must be writable for every returned argument.
    pub unsafe fn write_back(&self, args: &[MapArg]) {
        for (i, arg) in args.iter().enumerate() {
            if let Some(device_base) = arg.device_base {
                unsafe { *self.args_base.add(i) = device_base.as_u64() as usize as *mut c_void };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triple_stops_at_nul() {
        assert_eq!(image_triple(b"offload-host\0\x7fELF"), "offload-host");
        assert_eq!(image_triple(b"no-nul"), "no-nul");
        assert_eq!(image_triple(b""), "");
    }

    #[test]
    fn raw_args_convert_in_order() {
        let mut a = [1u32; 4];
        let mut b = [2u8; 3];
        let mut bases = [a.as_mut_ptr() as *mut c_void, b.as_mut_ptr() as *mut c_void];
        let mut begins = bases;
        let mut sizes = [16i64, 3];
        let mut types = [
            (MapType::TO | MapType::TARGET_PARAM).to_raw(),
            MapType::FROM.member_of(0).to_raw(),
        ];
        let raw = RawArgs {
            arg_num: 2,
            args_base: bases.as_mut_ptr(),
            args: begins.as_mut_ptr(),
            arg_sizes: sizes.as_mut_ptr(),
            arg_types: types.as_mut_ptr(),
            arg_mappers: std::ptr::null_mut(),
        };
        let args = unsafe { raw.to_map_args() }.unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].size, 16);
        assert_eq!(args[1].map_type.parent_index(), Some(0));
        assert!(args.iter().all(|a| a.mapper.is_none()));
    }

    #[test]
    fn missing_arrays_are_rejected() {
        let raw = RawArgs {
            arg_num: 1,
            args_base: std::ptr::null_mut(),
            args: std::ptr::null_mut(),
            arg_sizes: std::ptr::null_mut(),
            arg_types: std::ptr::null_mut(),
            arg_mappers: std::ptr::null_mut(),
        };
        assert!(unsafe { raw.to_map_args() }.is_err());
    }
}
