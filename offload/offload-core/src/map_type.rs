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

//! Bit-level contracts shared with compiler-generated code
//!
//! The values below are part of the wire format of the argument arrays and
//! offload-entry tables; they must match what the compiler emits bit for bit.

bitflags::bitflags! {
    /// Per-argument map-type bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapType: u64 {
        /// Copy host -> device on entry.
        const TO = 0x001;
        /// Copy device -> host on exit.
        const FROM = 0x002;
        /// Copy regardless of the reference count.
        const ALWAYS = 0x004;
        /// Force the entry to be removed on exit.
        const DELETE = 0x008;
        /// Pointer member whose pointee is mapped alongside it.
        const PTR_AND_OBJ = 0x010;
        /// Passed to the kernel as an argument.
        const TARGET_PARAM = 0x020;
        /// Device base address is returned to the caller.
        const RETURN_PARAM = 0x040;
        /// Private, never mapped persistently.
        const PRIVATE = 0x080;
        /// Passed by value.
        const LITERAL = 0x100;
        /// Mapped implicitly by the compiler.
        const IMPLICIT = 0x200;
        /// Force a device copy even under unified shared memory.
        const CLOSE = 0x400;
        /// The section must already be mapped.
        const PRESENT = 0x1000;
        /// 1-based index of the parent argument, packed in the top 16 bits.
        const MEMBER_OF = 0xffff_0000_0000_0000;
    }
}

const MEMBER_OF_SHIFT: u32 = 48;

/// Lambda captures are tagged with this exact combination.
const LAMBDA_CAPTURE: MapType = MapType::PTR_AND_OBJ
    .union(MapType::LITERAL)
    .union(MapType::IMPLICIT);

impl MapType {
    /// Reinterprets the signed value the compiler passes.
    pub const fn from_raw(raw: i64) -> Self {
        Self::from_bits_retain(raw as u64)
    }

    pub const fn to_raw(self) -> i64 {
        self.bits() as i64
    }

    /// Index of the parent argument this one is a member of.
    pub fn parent_index(self) -> Option<usize> {
        let encoded = (self.bits() & Self::MEMBER_OF.bits()) >> MEMBER_OF_SHIFT;
        (encoded as usize).checked_sub(1)
    }

    /// Marks this argument as a member of argument `parent`.
    pub fn member_of(self, parent: usize) -> Self {
        let encoded = ((parent as u64) + 1) << MEMBER_OF_SHIFT;
        Self::from_bits_retain((self.bits() & !Self::MEMBER_OF.bits()) | encoded)
    }

    pub fn is_member(self) -> bool {
        self.intersects(Self::MEMBER_OF)
    }

    /// Literal and private arguments have no persistent mapping.
    pub fn is_unmapped(self) -> bool {
        self.intersects(Self::LITERAL | Self::PRIVATE)
    }

    pub fn is_lambda_capture(self) -> bool {
        self.contains(LAMBDA_CAPTURE)
    }
}

bitflags::bitflags! {
    /// Flags attached to an offload-entry record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EntryFlags: i32 {
        /// Global that is linked rather than copied into the image.
        const LINK = 0x01;
        /// Constructor of a device global object.
        const CTOR = 0x02;
        /// Destructor of a device global object.
        const DTOR = 0x04;
    }
}

bitflags::bitflags! {
    /// `requires` clauses declared by the program.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequiresFlags: i64 {
        /// A library was registered without any `requires` clause.
        const NONE = 0x001;
        const REVERSE_OFFLOAD = 0x002;
        const UNIFIED_ADDRESS = 0x004;
        const UNIFIED_SHARED_MEMORY = 0x008;
        const DYNAMIC_ALLOCATORS = 0x010;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_index_roundtrip() {
        let t = (MapType::TO | MapType::FROM).member_of(3);
        assert_eq!(t.parent_index(), Some(3));
        assert!(t.is_member());
        assert!(t.contains(MapType::TO | MapType::FROM));
        assert_eq!(MapType::TO.parent_index(), None);
        assert!(!MapType::TO.is_member());
    }

    #[test]
    fn raw_values_match_wire_format() {
        // MEMBER_OF(1) | PTR_AND_OBJ | TO | FROM as a compiler would emit it.
        let raw: i64 = 0x0001_0000_0000_0013;
        let t = MapType::from_raw(raw);
        assert_eq!(t.parent_index(), Some(0));
        assert!(t.contains(MapType::PTR_AND_OBJ));
        assert_eq!(t.to_raw(), raw);
    }

    #[test]
    fn lambda_capture_needs_all_three_bits() {
        let capture = MapType::PTR_AND_OBJ | MapType::LITERAL | MapType::IMPLICIT;
        assert!(capture.member_of(0).is_lambda_capture());
        assert!(!(MapType::PTR_AND_OBJ | MapType::LITERAL).is_lambda_capture());
    }
}
