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

//! Host and device address spaces
//!
//! Host and device addresses live in two unrelated address spaces, so they get
//! two distinct types. Nothing converts one into the other implicitly; the
//! only bridges are the offset helpers below, which carry the displacement of
//! a host address relative to a mapped range over to the device side.

use std::fmt;

/// Size in bytes of a pointer slot on the host.
pub const POINTER_SIZE: usize = std::mem::size_of::<*const u8>();

/// An address in the host process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostAddress(usize);

impl HostAddress {
    pub const NULL: HostAddress = HostAddress(0);

    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes))
    }

    pub const fn sub(self, bytes: usize) -> Self {
        Self(self.0.wrapping_sub(bytes))
    }

    /// Signed displacement `self - base`.
    pub const fn delta_from(self, base: HostAddress) -> isize {
        self.0.wrapping_sub(base.0) as isize
    }

    /// Rounds down to a multiple of `align`; returns the rounded address and
    /// the number of bytes removed.
    pub const fn align_down(self, align: usize) -> (Self, usize) {
        let padding = self.0 % align;
        (Self(self.0 - padding), padding)
    }

    /// Views `size` bytes of host memory starting here.
    ///
    /// # Safety
    /// The range must be readable for the lifetime of the returned slice and
    /// must not be written concurrently.
    pub unsafe fn as_bytes<'a>(self, size: usize) -> &'a [u8] {
        if size == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.0 as *const u8, size) }
    }

    /// Reads the pointer value stored in the slot at this address.
    ///
    /// # Safety
    /// The address must point to a readable pointer-sized slot.
    pub unsafe fn read_pointer(self) -> HostAddress {
        let value = unsafe { std::ptr::read_unaligned(self.0 as *const usize) };
        HostAddress(value)
    }

    /// Stores `value` into the pointer slot at this address.
    ///
    /// # Safety
    /// The address must point to a writable pointer-sized slot.
    pub unsafe fn write_pointer(self, value: HostAddress) {
        unsafe { std::ptr::write_unaligned(self.0 as *mut usize, value.0) }
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// An address in the address space of an accelerator device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    pub const NULL: DeviceAddress = DeviceAddress(0);

    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes as u64))
    }

    /// Applies a signed displacement, e.g. one measured on the host side.
    pub const fn offset(self, delta: isize) -> Self {
        Self(self.0.wrapping_add(delta as i64 as u64))
    }

    /// Signed displacement `self - base`.
    pub const fn delta_from(self, base: DeviceAddress) -> isize {
        self.0.wrapping_sub(base.0) as i64 as isize
    }

    /// The bytes a device pointer slot holds when it points here.
    pub fn to_pointer_bytes(self) -> [u8; POINTER_SIZE] {
        (self.0 as usize).to_ne_bytes()
    }

    /// Whether this device address is numerically the same as `host`, which is
    /// what unified shared memory produces for unmapped data.
    pub const fn is_same_as_host(self, host: HostAddress) -> bool {
        self.0 == host.0 as u64
    }

    /// The device address numerically equal to `host`. Only valid when host and
    /// device share one address space.
    pub const fn unified(host: HostAddress) -> Self {
        Self(host.0 as u64)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// A mapped host section: `base` is the enclosing aggregate, `[begin, end)` the
/// bytes actually mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HostRange {
    pub base: HostAddress,
    pub begin: HostAddress,
    pub end: HostAddress,
}

impl HostRange {
    pub fn new(base: HostAddress, begin: HostAddress, size: usize) -> Self {
        Self {
            base,
            begin,
            end: begin.add(size),
        }
    }

    pub fn size(&self) -> usize {
        self.end.as_usize() - self.begin.as_usize()
    }

    /// `[begin, begin + size)` lies fully inside this range.
    pub fn contains(&self, begin: HostAddress, size: usize) -> bool {
        begin >= self.begin && begin < self.end && begin.add(size) <= self.end
    }

    /// Device address of `host` given that this range starts at `device_begin`.
    pub fn translate(&self, device_begin: DeviceAddress, host: HostAddress) -> DeviceAddress {
        device_begin.offset(host.delta_from(self.begin))
    }
}

/// Device address of an object's base given where one of its sub-ranges
/// landed: `device_begin - (host_begin - host_base)`.
pub fn device_base_of(
    device_begin: DeviceAddress,
    host_begin: HostAddress,
    host_base: HostAddress,
) -> DeviceAddress {
    device_begin.offset(-host_begin.delta_from(host_base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_down_reports_padding() {
        let (aligned, padding) = HostAddress::new(0x104).align_down(8);
        assert_eq!(aligned, HostAddress::new(0x100));
        assert_eq!(padding, 4);

        let (aligned, padding) = HostAddress::new(0x108).align_down(8);
        assert_eq!(aligned, HostAddress::new(0x108));
        assert_eq!(padding, 0);
    }

    #[test]
    fn range_containment() {
        let r = HostRange::new(HostAddress::new(0x100), HostAddress::new(0x100), 0x40);
        assert!(r.contains(HostAddress::new(0x100), 0x40));
        assert!(r.contains(HostAddress::new(0x120), 0x10));
        assert!(!r.contains(HostAddress::new(0x120), 0x30));
        assert!(!r.contains(HostAddress::new(0x140), 1));
        assert!(!r.contains(HostAddress::new(0xf0), 0x10));
    }

    #[test]
    fn translation_keeps_intra_object_delta() {
        let r = HostRange::new(HostAddress::new(0x1000), HostAddress::new(0x1010), 0x20);
        let dev = DeviceAddress::new(0x9000);
        assert_eq!(r.translate(dev, HostAddress::new(0x1018)), DeviceAddress::new(0x9008));
        assert_eq!(
            device_base_of(dev, HostAddress::new(0x1010), HostAddress::new(0x1000)),
            DeviceAddress::new(0x8ff0)
        );
    }

    #[test]
    fn pointer_slot_roundtrip() {
        let mut slot: usize = 0;
        let addr = HostAddress::from_mut_ptr(&mut slot as *mut usize);
        unsafe {
            addr.write_pointer(HostAddress::new(0xdead_beef));
            assert_eq!(addr.read_pointer(), HostAddress::new(0xdead_beef));
        }
        assert_eq!(slot, 0xdead_beef);
    }
}
