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

//! Runtime configuration read from the environment.
//!
//! **Env:** `OMP_TARGET_OFFLOAD` (mandatory/disabled/default), `OMP_DEFAULT_DEVICE`,
//! `OFFLOAD_HOST_DEVICES` (1–64), `OFFLOAD_ASYNC_QUEUE_CAPACITY` (2–1024), `OFFLOAD_INFO`
//! (bit 0 dumps mapping tables when an operation fails). Unparsable values keep the default.

use std::sync::{Mutex, OnceLock};

use crate::error::{OffloadError, Result};

static CONFIG_CACHE: OnceLock<Mutex<Option<RuntimeConfig>>> = OnceLock::new();

pub const DEFAULT_HOST_DEVICES: usize = 1;
pub const DEFAULT_ASYNC_QUEUE_CAPACITY: usize = 64;

/// `OFFLOAD_INFO` bit: dump the address map of a device when an operation on it fails.
pub const INFO_DUMP_ON_FAILURE: u32 = 0x1;

/// What happens when a target construct cannot be offloaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OffloadPolicy {
    /// Failure aborts the process.
    Mandatory,
    /// Everything runs on the host.
    Disabled,
    /// Offload when a device exists, fall back otherwise.
    #[default]
    Default,
}

impl OffloadPolicy {
    fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("mandatory") {
            Some(Self::Mandatory)
        } else if s.eq_ignore_ascii_case("disabled") {
            Some(Self::Disabled)
        } else if s.eq_ignore_ascii_case("default") {
            Some(Self::Default)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub offload_policy: OffloadPolicy,
    pub default_device: i64,
    pub host_devices: usize,
    pub async_queue_capacity: usize,
    pub info: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            offload_policy: OffloadPolicy::Default,
            default_device: 0,
            host_devices: DEFAULT_HOST_DEVICES,
            async_queue_capacity: DEFAULT_ASYNC_QUEUE_CAPACITY,
            info: 0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            offload_policy: std::env::var("OMP_TARGET_OFFLOAD")
                .ok()
                .and_then(|s| OffloadPolicy::parse(&s))
                .unwrap_or(defaults.offload_policy),
            default_device: env_parse("OMP_DEFAULT_DEVICE").unwrap_or(defaults.default_device),
            host_devices: env_parse("OFFLOAD_HOST_DEVICES").unwrap_or(defaults.host_devices),
            async_queue_capacity: env_parse("OFFLOAD_ASYNC_QUEUE_CAPACITY")
                .unwrap_or(defaults.async_queue_capacity),
            info: env_parse("OFFLOAD_INFO").unwrap_or(defaults.info),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_device < 0 {
            return Err(OffloadError::InvalidInput(format!(
                "OMP_DEFAULT_DEVICE must be non-negative, got {}",
                self.default_device
            )));
        }
        if !(1..=64).contains(&self.host_devices) {
            return Err(OffloadError::InvalidInput(format!(
                "host_devices must be 1..=64, got {}",
                self.host_devices
            )));
        }
        if !(2..=1024).contains(&self.async_queue_capacity) {
            return Err(OffloadError::InvalidInput(format!(
                "async_queue_capacity must be 2..=1024, got {}",
                self.async_queue_capacity
            )));
        }
        Ok(())
    }

    pub fn dump_on_failure(&self) -> bool {
        self.info & INFO_DUMP_ON_FAILURE != 0
    }

    /// Process-wide config, read from the environment on first use.
    pub fn get_or_init() -> Result<Self> {
        let cache = CONFIG_CACHE.get_or_init(|| Mutex::new(None));
        let mut guard = cache
            .lock()
            .map_err(|_| OffloadError::LockPoisoned("runtime config cache"))?;
        if let Some(ref config) = *guard {
            return Ok(config.clone());
        }
        let config = Self::from_env();
        config.validate()?;
        *guard = Some(config.clone());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serialize env-dependent tests so parallel runs don't cross-talk.
    static ENV_TEST_LOCK: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 5] = [
        "OMP_TARGET_OFFLOAD",
        "OMP_DEFAULT_DEVICE",
        "OFFLOAD_HOST_DEVICES",
        "OFFLOAD_ASYNC_QUEUE_CAPACITY",
        "OFFLOAD_INFO",
    ];

    fn clear_env() {
        for key in KEYS {
            unsafe {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn from_env_unset() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        clear_env();
        assert_eq!(RuntimeConfig::from_env(), RuntimeConfig::default());
    }

    #[test]
    fn from_env_parses() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("OMP_TARGET_OFFLOAD", "MANDATORY");
            std::env::set_var("OMP_DEFAULT_DEVICE", "2");
            std::env::set_var("OFFLOAD_HOST_DEVICES", "4");
            std::env::set_var("OFFLOAD_ASYNC_QUEUE_CAPACITY", "8");
            std::env::set_var("OFFLOAD_INFO", "1");
        }
        let c = RuntimeConfig::from_env();
        assert_eq!(c.offload_policy, OffloadPolicy::Mandatory);
        assert_eq!(c.default_device, 2);
        assert_eq!(c.host_devices, 4);
        assert_eq!(c.async_queue_capacity, 8);
        assert!(c.dump_on_failure());
        clear_env();
    }

    #[test]
    fn bad_values_keep_defaults() {
        let _guard = ENV_TEST_LOCK.lock().unwrap();
        unsafe {
            std::env::set_var("OMP_TARGET_OFFLOAD", "sometimes");
            std::env::set_var("OFFLOAD_HOST_DEVICES", "many");
        }
        let c = RuntimeConfig::from_env();
        assert_eq!(c.offload_policy, OffloadPolicy::Default);
        assert_eq!(c.host_devices, DEFAULT_HOST_DEVICES);
        clear_env();
    }

    #[test]
    fn validate_bounds() {
        let c = RuntimeConfig::default();
        assert!(c.validate().is_ok());
        assert!(
            RuntimeConfig {
                host_devices: 0,
                ..c.clone()
            }
            .validate()
            .is_err()
        );
        assert!(
            RuntimeConfig {
                host_devices: 65,
                ..c.clone()
            }
            .validate()
            .is_err()
        );
        assert!(
            RuntimeConfig {
                async_queue_capacity: 1,
                ..c.clone()
            }
            .validate()
            .is_err()
        );
        assert!(
            RuntimeConfig {
                default_device: -3,
                ..c
            }
            .validate()
            .is_err()
        );
    }
}
