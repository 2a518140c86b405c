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

//! Mapping requests as handed over by compiler-generated code.

use std::fmt;
use std::sync::Arc;

use crate::address::{DeviceAddress, HostAddress};
use crate::error::Result;
use crate::map_type::MapType;

/// One entry of the argument arrays of a target construct.
#[derive(Clone)]
pub struct MapArg {
    pub base: HostAddress,
    pub begin: HostAddress,
    pub size: usize,
    pub map_type: MapType,
    pub mapper: Option<Arc<dyn Mapper>>,
    /// Filled in for RETURN_PARAM arguments once the section is mapped.
    pub device_base: Option<DeviceAddress>,
}

impl MapArg {
    pub fn new(base: HostAddress, begin: HostAddress, size: usize, map_type: MapType) -> Self {
        Self {
            base,
            begin,
            size,
            map_type,
            mapper: None,
            device_base: None,
        }
    }

    /// Maps all of `value`, using it as its own base.
    pub fn whole<T: ?Sized>(value: &T, map_type: MapType) -> Self {
        let addr = HostAddress::from_ptr(value as *const T as *const u8);
        Self::new(addr, addr, std::mem::size_of_val(value), map_type)
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.mapper = Some(mapper);
        self
    }

    pub fn end(&self) -> HostAddress {
        self.begin.add(self.size)
    }
}

impl fmt::Debug for MapArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapArg")
            .field("base", &self.base)
            .field("begin", &self.begin)
            .field("size", &self.size)
            .field("map_type", &self.map_type)
            .field("mapper", &self.mapper.is_some())
            .field("device_base", &self.device_base)
            .finish()
    }
}

/// Components a custom mapper produced for one argument.
#[derive(Debug, Default)]
pub struct MapperComponents {
    components: Vec<MapArg>,
}

impl MapperComponents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, base: HostAddress, begin: HostAddress, size: usize, map_type: MapType) {
        self.components.push(MapArg::new(base, begin, size, map_type));
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn into_args(self) -> Vec<MapArg> {
        self.components
    }
}

/// A user-defined mapper: expands one mapping request into the list of
/// requests that describe the object's layout.
pub trait Mapper: Send + Sync {
    fn map(&self, arg: &MapArg, components: &mut MapperComponents) -> Result<()>;
}

impl<F> Mapper for F
where
    F: Fn(&MapArg, &mut MapperComponents) -> Result<()> + Send + Sync,
{
    fn map(&self, arg: &MapArg, components: &mut MapperComponents) -> Result<()> {
        self(arg, components)
    }
}

/// Runs the mapper attached to `arg` and returns the expanded argument list.
pub(crate) fn expand(mapper: &dyn Mapper, arg: &MapArg) -> Result<Vec<MapArg>> {
    let mut components = MapperComponents::new();
    mapper.map(arg, &mut components)?;
    log::debug!(
        "mapper expanded {} ({} bytes) into {} components",
        arg.begin,
        arg.size,
        components.len()
    );
    Ok(components.into_args())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_covers_value() {
        let data = [0u32; 8];
        let arg = MapArg::whole(&data[..], MapType::TO);
        assert_eq!(arg.size, 32);
        assert_eq!(arg.base, arg.begin);
        assert_eq!(arg.end(), arg.begin.add(32));
    }

    #[test]
    fn closure_mapper_expands() {
        let mapper = |arg: &MapArg, c: &mut MapperComponents| -> Result<()> {
            c.push(arg.base, arg.begin, 4, MapType::TO);
            c.push(arg.base, arg.begin.add(4), 4, MapType::FROM);
            Ok(())
        };
        let arg = MapArg::new(HostAddress::new(0x100), HostAddress::new(0x100), 8, MapType::TO);
        let out = expand(&mapper, &arg).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].begin, HostAddress::new(0x104));
        assert_eq!(out[1].map_type, MapType::FROM);
    }
}
