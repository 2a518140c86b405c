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

//! Per-device worker: one thread draining a bounded queue of copies and launches.
//!
//! Work submitted through the same `AsyncInfo` executes in submission order since
//! a device has exactly one worker. The bounded queue gives backpressure to
//! producers that run ahead of the device.

use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::error::{OffloadError, Result};

pub(crate) type Job = Box<dyn FnOnce() -> Result<()> + Send>;

struct WorkItem {
    job: Job,
    done: Sender<Result<()>>,
}

fn worker_loop(job_rx: Receiver<WorkItem>) {
    while let Ok(item) = job_rx.recv() {
        let result = (item.job)();
        let _ = item.done.send(result);
    }
}

pub(crate) struct DeviceWorker {
    job_tx: Option<Sender<WorkItem>>,
    join: Option<thread::JoinHandle<()>>,
}

impl DeviceWorker {
    pub(crate) fn spawn(device: usize, capacity: usize) -> Result<Self> {
        let (job_tx, job_rx) = bounded(capacity);
        let join = thread::Builder::new()
            .name(format!("offload-host-device-{device}"))
            .spawn(move || worker_loop(job_rx))
            .map_err(|e| {
                OffloadError::Plugin(format!("failed to spawn worker for device {device}: {e}"))
            })?;
        log::debug!("started async worker for host device {device} (queue capacity {capacity})");
        Ok(Self {
            job_tx: Some(job_tx),
            join: Some(join),
        })
    }

    /// Queues `job`; blocks only while the queue is full.
    pub(crate) fn enqueue(&self, job: Job) -> Result<Receiver<Result<()>>> {
        let (done, done_rx) = bounded(1);
        self.job_tx
            .as_ref()
            .ok_or_else(|| OffloadError::Plugin("device worker shut down".to_string()))?
            .send(WorkItem { job, done })
            .map_err(|_| OffloadError::Plugin("device worker channel closed".to_string()))?;
        Ok(done_rx)
    }

    /// Blocks until everything queued before this call has run.
    pub(crate) fn drain(&self) -> Result<()> {
        self.enqueue(Box::new(|| Ok(())))?
            .recv()
            .map_err(|_| OffloadError::Plugin("device worker dropped a job".to_string()))?
    }
}

impl Drop for DeviceWorker {
    fn drop(&mut self) {
        self.job_tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Completion handles of the work queued through one `AsyncInfo`.
#[derive(Default)]
pub(crate) struct HostStream {
    pending: Vec<Receiver<Result<()>>>,
}

impl HostStream {
    pub(crate) fn push(&mut self, done: Receiver<Result<()>>) {
        self.pending.push(done);
    }

    /// Waits for everything queued so far; reports the first failure.
    pub(crate) fn wait(&mut self) -> Result<()> {
        let mut first_err = None;
        for done in self.pending.drain(..) {
            let result = done
                .recv()
                .map_err(|_| OffloadError::Plugin("device worker dropped a job".to_string()))
                .and_then(|r| r);
            if let Err(e) = result
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_in_order() {
        let worker = DeviceWorker::spawn(0, 2).unwrap();
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut stream = HostStream::default();
        for i in 0..8 {
            let log = log.clone();
            stream.push(
                worker
                    .enqueue(Box::new(move || {
                        log.lock().unwrap().push(i);
                        Ok(())
                    }))
                    .unwrap(),
            );
        }
        stream.wait().unwrap();
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn wait_reports_first_error_and_drains() {
        let worker = DeviceWorker::spawn(1, 4).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let mut stream = HostStream::default();
        for i in 0..3 {
            let ran = ran.clone();
            stream.push(
                worker
                    .enqueue(Box::new(move || {
                        ran.fetch_add(1, Ordering::SeqCst);
                        if i == 1 {
                            Err(OffloadError::Transfer(format!("job {i}")))
                        } else {
                            Ok(())
                        }
                    }))
                    .unwrap(),
            );
        }
        let err = stream.wait().unwrap_err();
        assert!(err.to_string().contains("job 1"));
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(stream.wait().is_ok());
    }
}
