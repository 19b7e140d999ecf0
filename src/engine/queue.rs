// SPDX-License-Identifier: MIT
// Copyright 2026 Tyler Zervas

//! Per-stream FIFO work queues and their worker threads.

use super::host::Region;
use super::module::LoadedModule;
use super::KernelFn;
use crate::error::Result;
use crate::host::HostBuffer;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::ffi::c_void;
use std::ptr;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Resolved argument value. Regions are held until the task has run.
pub(crate) enum TaskArg {
    Null,
    Region(Arc<Region>),
    Scalar(Box<[u64; 2]>),
}

/// A validated operation with every address resolved to its region.
pub(crate) enum Task {
    HostToDevice {
        src: HostBuffer,
        src_offset: usize,
        dst: Arc<Region>,
        dst_offset: usize,
        nbytes: usize,
    },
    DeviceToHost {
        src: Arc<Region>,
        src_offset: usize,
        dst: HostBuffer,
        dst_offset: usize,
        nbytes: usize,
    },
    DeviceToDevice {
        src: Arc<Region>,
        src_offset: usize,
        dst: Arc<Region>,
        dst_offset: usize,
        nbytes: usize,
    },
    Invoke {
        module: Arc<LoadedModule>,
        kernel: KernelFn,
        name: String,
        dims: Vec<i64>,
        types: Vec<i64>,
        values: Vec<TaskArg>,
        sizes: Vec<i64>,
    },
}

impl Task {
    fn run(self) {
        match self {
            Self::HostToDevice {
                src,
                src_offset,
                dst,
                dst_offset,
                nbytes,
            } => src.with_bytes(|bytes| {
                let bytes = &bytes[src_offset..src_offset + nbytes];
                // SAFETY: the range was checked against the region at enqueue time.
                unsafe {
                    ptr::copy_nonoverlapping(bytes.as_ptr(), dst.as_ptr().add(dst_offset), nbytes);
                }
            }),
            Self::DeviceToHost {
                src,
                src_offset,
                dst,
                dst_offset,
                nbytes,
            } => dst.with_bytes_mut(|bytes| {
                let bytes = &mut bytes[dst_offset..dst_offset + nbytes];
                // SAFETY: the range was checked against the region at enqueue time.
                unsafe {
                    ptr::copy_nonoverlapping(src.as_ptr().add(src_offset), bytes.as_mut_ptr(), nbytes);
                }
            }),
            Self::DeviceToDevice {
                src,
                src_offset,
                dst,
                dst_offset,
                nbytes,
            } => {
                // SAFETY: both ranges were checked at enqueue time; they may overlap.
                unsafe {
                    ptr::copy(src.as_ptr().add(src_offset), dst.as_ptr().add(dst_offset), nbytes);
                }
            }
            Self::Invoke {
                module,
                kernel,
                name,
                dims,
                types,
                mut values,
                sizes,
            } => {
                let ptrs: Vec<*mut c_void> = values
                    .iter_mut()
                    .map(|value| match value {
                        TaskArg::Null => ptr::null_mut(),
                        TaskArg::Region(region) => region.as_ptr().cast(),
                        TaskArg::Scalar(words) => words.as_mut_ptr().cast(),
                    })
                    .collect();
                tracing::trace!(kernel = %name, argc = ptrs.len(), "running kernel");
                #[allow(clippy::cast_possible_wrap)]
                let argc = ptrs.len() as i64;
                // SAFETY: the descriptor tables outlive the call, every
                // array pointer refers to a live region or is null, and
                // `module` keeps the kernel's image loaded.
                unsafe {
                    kernel(argc, dims.as_ptr(), types.as_ptr(), ptrs.as_ptr(), sizes.as_ptr());
                }
                // Last reference if the library was unloaded while queued.
                drop(module);
            }
        }
    }
}

struct QueueState {
    tasks: VecDeque<Task>,
    pending: usize,
    shutdown: bool,
}

/// FIFO of tasks with a count of work not yet completed.
pub(crate) struct WorkQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    drained: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                pending: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, task: Task) {
        let mut state = self.state.lock();
        state.tasks.push_back(task);
        state.pending += 1;
        self.available.notify_one();
    }

    /// Next task, or `None` once shut down and empty.
    fn pop(&self) -> Option<Task> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.tasks.pop_front() {
                return Some(task);
            }
            if state.shutdown {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    fn complete(&self) {
        let mut state = self.state.lock();
        state.pending -= 1;
        if state.pending == 0 {
            self.drained.notify_all();
        }
    }

    /// Block until every pushed task has run.
    pub(crate) fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.pending > 0 {
            self.drained.wait(&mut state);
        }
    }

    fn shutdown(&self) {
        self.state.lock().shutdown = true;
        self.available.notify_all();
    }
}

/// A stream's queue and the thread draining it.
pub(crate) struct StreamWorker {
    pub(crate) device: usize,
    pub(crate) queue: Arc<WorkQueue>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    pub(crate) fn spawn(id: u64, device: usize) -> Result<Self> {
        let queue = Arc::new(WorkQueue::new());
        let worker_queue = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name(format!("offload-stream-{id}"))
            .spawn(move || {
                while let Some(task) = worker_queue.pop() {
                    task.run();
                    worker_queue.complete();
                }
            })?;
        Ok(Self {
            device,
            queue,
            handle: Some(handle),
        })
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.queue.shutdown();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("stream worker on device {} panicked", self.device);
            }
        }
    }
}
