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

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{OffloadError, Result, lock};
use crate::map_type::RequiresFlags;

/// `requires` clauses every compilation unit of the program agreed on.
#[derive(Debug, Default)]
pub struct Requirements {
    flags: Mutex<Option<RequiresFlags>>,
    unified_shared_memory: AtomicBool,
}

/// Clauses that must be identical across compilation units.
const MUST_AGREE: [(RequiresFlags, &str); 3] = [
    (RequiresFlags::REVERSE_OFFLOAD, "reverse_offload"),
    (RequiresFlags::UNIFIED_ADDRESS, "unified_address"),
    (RequiresFlags::UNIFIED_SHARED_MEMORY, "unified_shared_memory"),
];

impl Requirements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, flags: RequiresFlags) -> Result<()> {
        let mut current = lock(&self.flags, "requires flags")?;
        let Some(existing) = *current else {
            log::debug!("requires flags set to {flags:?}");
            *current = Some(flags);
            self.unified_shared_memory.store(
                flags.contains(RequiresFlags::UNIFIED_SHARED_MEMORY),
                Ordering::Release,
            );
            return Ok(());
        };
        // A unit without any clause is compatible with everything.
        if flags == RequiresFlags::NONE || existing == RequiresFlags::NONE {
            if existing == RequiresFlags::NONE {
                *current = Some(flags);
                self.unified_shared_memory.store(
                    flags.contains(RequiresFlags::UNIFIED_SHARED_MEMORY),
                    Ordering::Release,
                );
            }
            return Ok(());
        }
        for (flag, name) in MUST_AGREE {
            if existing.contains(flag) != flags.contains(flag) {
                return Err(OffloadError::InvalidInput(format!(
                    "'#pragma omp requires {name}' not used consistently"
                )));
            }
        }
        *current = Some(existing | flags);
        Ok(())
    }

    pub fn flags(&self) -> Result<RequiresFlags> {
        Ok(lock(&self.flags, "requires flags")?.unwrap_or(RequiresFlags::NONE))
    }

    pub fn unified_shared_memory(&self) -> bool {
        self.unified_shared_memory.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registration_wins() {
        let r = Requirements::new();
        assert!(!r.unified_shared_memory());
        r.register(RequiresFlags::UNIFIED_SHARED_MEMORY).unwrap();
        assert!(r.unified_shared_memory());
        r.register(RequiresFlags::NONE).unwrap();
        assert!(r.unified_shared_memory());
    }

    #[test]
    fn inconsistent_clauses_are_rejected() {
        let r = Requirements::new();
        r.register(RequiresFlags::REVERSE_OFFLOAD).unwrap();
        let err = r.register(RequiresFlags::UNIFIED_ADDRESS).unwrap_err();
        assert!(err.to_string().contains("unified_address"));
    }

    #[test]
    fn dynamic_allocators_may_differ() {
        let r = Requirements::new();
        r.register(RequiresFlags::UNIFIED_ADDRESS).unwrap();
        r.register(RequiresFlags::UNIFIED_ADDRESS | RequiresFlags::DYNAMIC_ALLOCATORS)
            .unwrap();
        assert!(r.flags().unwrap().contains(RequiresFlags::DYNAMIC_ALLOCATORS));
    }
}
