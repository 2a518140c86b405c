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

//! C entry points called by compiler-generated host code.
//!
//! All entry points share one process-wide runtime backed by the host plugin.
//! Failures are logged and reported as `OFFLOAD_FAIL`; under the `mandatory`
//! offload policy they abort the process instead.

pub mod abi;

use std::collections::HashMap;
use std::ffi::{CStr, c_char, c_void};
use std::sync::{Arc, Mutex, OnceLock};

use offload_core::{
    DeviceAddress, HostAddress, HostPlugin, KernelLaunch, LibraryId, MapType, MapperComponents,
    OFFLOAD_FAIL, OFFLOAD_SUCCESS, OffloadError, OffloadPolicy, OffloadRuntime, RequiresFlags,
    Result, RuntimeConfig, status_code,
};

use crate::abi::{BinDesc, RawArgs};

/// Host-plugin kernel as exported by C code. `args` holds `arg_num` device
/// addresses; a non-zero return is a launch failure.
pub type HostKernelFn = unsafe extern "C" fn(
    args: *mut *mut c_void,
    arg_num: i32,
    team_count: i32,
    thread_limit: i32,
    loop_trip_count: u64,
) -> i32;

struct FfiRuntime {
    runtime: OffloadRuntime,
    host: Arc<HostPlugin>,
    /// Registered descriptors by address.
    libraries: Mutex<HashMap<usize, LibraryId>>,
}

static RUNTIME: OnceLock<std::result::Result<FfiRuntime, String>> = OnceLock::new();

fn runtime() -> Result<&'static FfiRuntime> {
    RUNTIME
        .get_or_init(|| {
            let built = RuntimeConfig::get_or_init()
                .and_then(OffloadRuntime::with_host_plugin)
                .map(|(runtime, host)| FfiRuntime {
                    runtime,
                    host,
                    libraries: Mutex::new(HashMap::new()),
                });
            match built {
                Ok(rt) => {
                    log::info!(
                        "offload runtime ready: {} device(s), policy {:?}",
                        rt.runtime.num_devices(),
                        rt.runtime.config().offload_policy
                    );
                    Ok(rt)
                }
                Err(e) => Err(e.to_string()),
            }
        })
        .as_ref()
        .map_err(|e| OffloadError::Plugin(format!("runtime initialization failed: {e}")))
}

/// Logs a failure and converts it to a status code. Under the mandatory
/// policy a failure is fatal.
fn finish<T>(what: &str, result: Result<T>) -> i32 {
    if let Err(ref e) = result {
        log::error!("{what}: {e}");
        let mandatory = RUNTIME
            .get()
            .and_then(|rt| rt.as_ref().ok())
            .is_some_and(|rt| rt.runtime.config().offload_policy == OffloadPolicy::Mandatory);
        if mandatory {
            log::error!("{what}: offloading is mandatory, aborting");
            std::process::abort();
        }
    }
    status_code(&result)
}

#[unsafe(no_mangle)]
pub extern "C" fn __tgt_register_requires(flags: i64) {
    let result = runtime().and_then(|rt| {
        rt.runtime
            .register_requires(RequiresFlags::from_bits_retain(flags))
    });
    finish("__tgt_register_requires", result);
}

/// # Safety
/// `desc` must point to a compiler-emitted descriptor that stays valid until
/// the matching `__tgt_unregister_lib`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tgt_register_lib(desc: *mut BinDesc) {
    let result = runtime().and_then(|rt| {
        let id = rt.runtime.register_library(unsafe { abi::binary_descriptor(desc)? })?;
        rt.libraries
            .lock()
            .map_err(|_| OffloadError::LockPoisoned("ffi library table"))?
            .insert(desc as usize, id);
        Ok(())
    });
    finish("__tgt_register_lib", result);
}

/// # Safety
/// `desc` must be a descriptor previously passed to `__tgt_register_lib`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tgt_unregister_lib(desc: *mut BinDesc) {
    let result = runtime().and_then(|rt| {
        let id = rt
            .libraries
            .lock()
            .map_err(|_| OffloadError::LockPoisoned("ffi library table"))?
            .remove(&(desc as usize))
            .ok_or_else(|| {
                OffloadError::InvalidInput(format!("descriptor {desc:p} was never registered"))
            })?;
        rt.runtime.unregister_library(id)
    });
    finish("__tgt_unregister_lib", result);
}

#[derive(Clone, Copy)]
enum DataOp {
    Begin,
    End,
    Update,
}

unsafe fn data_op(op: DataOp, device_id: i64, raw: RawArgs) -> Result<()> {
    let rt = runtime()?;
    let mut args = unsafe { raw.to_map_args()? };
    match op {
        DataOp::Begin => {
            unsafe { rt.runtime.target_data_begin(device_id, &mut args)? };
            unsafe { raw.write_back(&args) };
            Ok(())
        }
        DataOp::End => unsafe { rt.runtime.target_data_end(device_id, &mut args) },
        DataOp::Update => unsafe { rt.runtime.target_data_update(device_id, &mut args) },
    }
}

macro_rules! data_entry_points {
    ($op:expr, $plain:ident, $with_mapper:ident) => {
        /// # Safety
        /// The argument arrays must each hold `arg_num` elements describing
        /// valid host memory.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $plain(
            device_id: i64,
            arg_num: i32,
            args_base: *mut *mut c_void,
            args: *mut *mut c_void,
            arg_sizes: *mut i64,
            arg_types: *mut i64,
        ) {
            unsafe {
                $with_mapper(
                    device_id,
                    arg_num,
                    args_base,
                    args,
                    arg_sizes,
                    arg_types,
                    std::ptr::null_mut(),
                )
            }
        }

        /// # Safety
        /// As for the variant without mappers; `arg_mappers` is null or holds
        /// `arg_num` nullable mapper functions.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $with_mapper(
            device_id: i64,
            arg_num: i32,
            args_base: *mut *mut c_void,
            args: *mut *mut c_void,
            arg_sizes: *mut i64,
            arg_types: *mut i64,
            arg_mappers: *mut *mut c_void,
        ) {
            let raw = RawArgs {
                arg_num,
                args_base,
                args,
                arg_sizes,
                arg_types,
                arg_mappers,
            };
            finish(stringify!($plain), unsafe { data_op($op, device_id, raw) });
        }
    };
}

data_entry_points!(
    DataOp::Begin,
    __tgt_target_data_begin,
    __tgt_target_data_begin_mapper
);
data_entry_points!(DataOp::End, __tgt_target_data_end, __tgt_target_data_end_mapper);
data_entry_points!(
    DataOp::Update,
    __tgt_target_data_update,
    __tgt_target_data_update_mapper
);

unsafe fn launch(
    device_id: i64,
    host_ptr: *mut c_void,
    raw: RawArgs,
    teams: Option<(i32, i32)>,
) -> Result<()> {
    let rt = runtime()?;
    let mut args = unsafe { raw.to_map_args()? };
    let host_entry = HostAddress::from_mut_ptr(host_ptr);
    match teams {
        None => unsafe { rt.runtime.target(device_id, host_entry, &mut args) },
        Some((team_count, thread_limit)) => unsafe {
            rt.runtime
                .target_teams(device_id, host_entry, &mut args, team_count, thread_limit)
        },
    }
}

/// # Safety
/// As for `__tgt_target_data_begin`; `host_ptr` is the host stub of a region.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tgt_target(
    device_id: i64,
    host_ptr: *mut c_void,
    arg_num: i32,
    args_base: *mut *mut c_void,
    args: *mut *mut c_void,
    arg_sizes: *mut i64,
    arg_types: *mut i64,
) -> i32 {
    unsafe {
        __tgt_target_mapper(
            device_id,
            host_ptr,
            arg_num,
            args_base,
            args,
            arg_sizes,
            arg_types,
            std::ptr::null_mut(),
        )
    }
}

/// # Safety
/// As for `__tgt_target`, plus nullable mapper functions.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tgt_target_mapper(
    device_id: i64,
    host_ptr: *mut c_void,
    arg_num: i32,
    args_base: *mut *mut c_void,
    args: *mut *mut c_void,
    arg_sizes: *mut i64,
    arg_types: *mut i64,
    arg_mappers: *mut *mut c_void,
) -> i32 {
    let raw = RawArgs {
        arg_num,
        args_base,
        args,
        arg_sizes,
        arg_types,
        arg_mappers,
    };
    finish("__tgt_target", unsafe {
        launch(device_id, host_ptr, raw, None)
    })
}

/// # Safety
/// As for `__tgt_target`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tgt_target_teams(
    device_id: i64,
    host_ptr: *mut c_void,
    arg_num: i32,
    args_base: *mut *mut c_void,
    args: *mut *mut c_void,
    arg_sizes: *mut i64,
    arg_types: *mut i64,
    team_num: i32,
    thread_limit: i32,
) -> i32 {
    unsafe {
        __tgt_target_teams_mapper(
            device_id,
            host_ptr,
            arg_num,
            args_base,
            args,
            arg_sizes,
            arg_types,
            std::ptr::null_mut(),
            team_num,
            thread_limit,
        )
    }
}

/// # Safety
/// As for `__tgt_target_mapper`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tgt_target_teams_mapper(
    device_id: i64,
    host_ptr: *mut c_void,
    arg_num: i32,
    args_base: *mut *mut c_void,
    args: *mut *mut c_void,
    arg_sizes: *mut i64,
    arg_types: *mut i64,
    arg_mappers: *mut *mut c_void,
    team_num: i32,
    thread_limit: i32,
) -> i32 {
    let raw = RawArgs {
        arg_num,
        args_base,
        args,
        arg_sizes,
        arg_types,
        arg_mappers,
    };
    finish("__tgt_target_teams", unsafe {
        launch(device_id, host_ptr, raw, Some((team_num, thread_limit)))
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn __kmpc_push_target_tripcount(device_id: i64, loop_trip_count: u64) {
    let result =
        runtime().and_then(|rt| rt.runtime.push_target_trip_count(device_id, loop_trip_count));
    finish("__kmpc_push_target_tripcount", result);
}

/// # Safety
/// `handle` must be the handle a mapper function received.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tgt_mapper_num_components(handle: *mut c_void) -> i64 {
    match unsafe { (handle as *const MapperComponents).as_ref() } {
        Some(components) => components.len() as i64,
        None => 0,
    }
}

/// # Safety
/// `handle` must be the handle a mapper function received.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __tgt_push_mapper_component(
    handle: *mut c_void,
    base: *mut c_void,
    begin: *mut c_void,
    size: i64,
    map_type: i64,
) {
    let Some(components) = (unsafe { (handle as *mut MapperComponents).as_mut() }) else {
        log::error!("__tgt_push_mapper_component: null handle");
        return;
    };
    components.push(
        HostAddress::from_mut_ptr(base),
        HostAddress::from_mut_ptr(begin),
        usize::try_from(size).unwrap_or(0),
        MapType::from_raw(map_type),
    );
}

#[unsafe(no_mangle)]
pub extern "C" fn omp_get_num_devices() -> i32 {
    runtime().map_or(0, |rt| rt.runtime.num_devices() as i32)
}

#[unsafe(no_mangle)]
pub extern "C" fn omp_get_initial_device() -> i32 {
    runtime().map_or(0, |rt| rt.runtime.initial_device() as i32)
}

#[unsafe(no_mangle)]
pub extern "C" fn omp_target_alloc(size: usize, device_num: i32) -> *mut c_void {
    let result = runtime().and_then(|rt| rt.runtime.target_alloc(size, device_num as i64));
    match result {
        Ok(ptr) => ptr.as_u64() as usize as *mut c_void,
        Err(e) => {
            log::error!("omp_target_alloc: {e}");
            std::ptr::null_mut()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn omp_target_free(device_ptr: *mut c_void, device_num: i32) {
    let ptr = DeviceAddress::new(device_ptr as usize as u64);
    let result = runtime().and_then(|rt| rt.runtime.target_free(ptr, device_num as i64));
    if let Err(e) = result {
        log::error!("omp_target_free: {e}");
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn omp_target_is_present(ptr: *const c_void, device_num: i32) -> i32 {
    let result = runtime()
        .and_then(|rt| rt.runtime.is_present(HostAddress::from_ptr(ptr), device_num as i64));
    match result {
        Ok(present) => present as i32,
        Err(e) => {
            log::error!("omp_target_is_present: {e}");
            0
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn omp_target_associate_ptr(
    host_ptr: *const c_void,
    device_ptr: *const c_void,
    size: usize,
    device_offset: usize,
    device_num: i32,
) -> i32 {
    let result = runtime().and_then(|rt| {
        rt.runtime.associate_ptr(
            HostAddress::from_ptr(host_ptr),
            DeviceAddress::new(device_ptr as usize as u64),
            size,
            device_offset,
            device_num as i64,
        )
    });
    if let Err(ref e) = result {
        log::error!("omp_target_associate_ptr: {e}");
    }
    status_code(&result)
}

#[unsafe(no_mangle)]
pub extern "C" fn omp_target_disassociate_ptr(host_ptr: *const c_void, device_num: i32) -> i32 {
    let result = runtime().and_then(|rt| {
        rt.runtime
            .disassociate_ptr(HostAddress::from_ptr(host_ptr), device_num as i64)
    });
    if let Err(ref e) = result {
        log::error!("omp_target_disassociate_ptr: {e}");
    }
    status_code(&result)
}

/// Makes a C function launchable as the host-plugin kernel `name`.
///
/// # Safety
/// `name` must be a NUL-terminated string; `kernel` must honor its signature.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn __offload_host_register_kernel(
    name: *const c_char,
    kernel: HostKernelFn,
) -> i32 {
    if name.is_null() {
        log::error!("__offload_host_register_kernel: null name");
        return OFFLOAD_FAIL;
    }
    let name = unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned();
    let result = runtime().and_then(|rt| {
        let launch_name = name.clone();
        rt.host.register_kernel(
            name,
            Arc::new(move |launch: &KernelLaunch<'_>| {
                let mut args: Vec<*mut c_void> =
                    launch.args.iter().map(|a| *a as *mut c_void).collect();
                let rc = unsafe {
                    kernel(
                        args.as_mut_ptr(),
                        args.len() as i32,
                        launch.team_count,
                        launch.thread_limit,
                        launch.loop_trip_count,
                    )
                };
                if rc == OFFLOAD_SUCCESS {
                    Ok(())
                } else {
                    Err(OffloadError::KernelLaunch(format!(
                        "kernel '{launch_name}' returned {rc}"
                    )))
                }
            }),
        )
    });
    if let Err(ref e) = result {
        log::error!("__offload_host_register_kernel: {e}");
    }
    status_code(&result)
}
