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

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::address::HostAddress;

/// Failures reported by the offloading runtime.
///
/// Every failure aborts only the operation that produced it; the caller decides
/// whether the enclosing target construct falls back to the host.
#[derive(Debug, thiserror::Error)]
pub enum OffloadError {
    #[error("device {0} is not ready")]
    DeviceNotReady(i64),

    #[error(
        "device mapping required by 'present' modifier does not exist for host address {addr} ({size} bytes)"
    )]
    NotPresent { addr: HostAddress, size: usize },

    #[error(
        "explicit extension not allowed: host address {addr} ({size} bytes), but device allocation maps to host at {mapped_begin} ({mapped_size} bytes)"
    )]
    IllegalExtension {
        addr: HostAddress,
        size: usize,
        mapped_begin: HostAddress,
        mapped_size: usize,
    },

    #[error("section to delete (host address {addr}, {size} bytes) is not mapped")]
    NotMapped { addr: HostAddress, size: usize },

    #[error("device allocation of {size} bytes failed: {reason}")]
    Allocation { size: usize, reason: String },

    #[error("host pointer {0} does not have a matching target entry")]
    UnresolvedEntry(HostAddress),

    #[error("data transfer failed: {0}")]
    Transfer(String),

    #[error("kernel launch failed: {0}")]
    KernelLaunch(String),

    #[error("image load failed: {0}")]
    ImageLoad(String),

    #[error("device plugin error: {0}")]
    Plugin(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("offloading is disabled")]
    OffloadDisabled,

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, OffloadError>;

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| OffloadError::LockPoisoned(what))
}

pub(crate) fn read<'a, T>(
    rwlock: &'a RwLock<T>,
    what: &'static str,
) -> Result<RwLockReadGuard<'a, T>> {
    rwlock.read().map_err(|_| OffloadError::LockPoisoned(what))
}

pub(crate) fn write<'a, T>(
    rwlock: &'a RwLock<T>,
    what: &'static str,
) -> Result<RwLockWriteGuard<'a, T>> {
    rwlock.write().map_err(|_| OffloadError::LockPoisoned(what))
}

/// Status code handed across the C boundary.
pub const OFFLOAD_SUCCESS: i32 = 0;
pub const OFFLOAD_FAIL: i32 = !0;

/// Collapses a result into the C status convention.
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => OFFLOAD_SUCCESS,
        Err(_) => OFFLOAD_FAIL,
    }
}
