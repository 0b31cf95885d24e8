// =============================================================================
// CPU EXECUTOR - Runs submitted command lists
// =============================================================================
//
// One queue thread drains submissions in order. Each dispatch fans its
// workgroups out over a fixed rayon pool; every workgroup runs its
// invocations as independent interpreter states. A submission's fences are
// signaled once the in-flight workgroup count is back to where it was before
// the submission started.

use parking_lot::Mutex;
use rayon::prelude::*;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::command_list::{SoftCommand, SoftDispatchSize};
use super::fence::SoftFence;
use super::pipeline::SoftPipeline;
use super::spirv::{run_workgroup, ExecContext, WorkgroupKey};
use super::binding::SoftGroup;
use crate::debug::DebugSink;
use crate::error::{Error, Result};

pub(crate) struct Submission {
    pub commands: Vec<SoftCommand>,
    pub fence: Option<Arc<SoftFence>>,
    pub done: Arc<SoftFence>,
}

/// State shared between the queue thread and the workers
struct Shared {
    workers: rayon::ThreadPool,
    in_flight: AtomicUsize,
    dispatch_serial: AtomicU64,
    sink: Arc<DebugSink>,
}

pub struct SoftExecutor {
    shared: Arc<Shared>,
    sender: Mutex<Option<Sender<Submission>>>,
    queue: Mutex<Option<JoinHandle<()>>>,
}

/// Decrements the in-flight count when a workgroup finishes, even on panic
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Signals a submission's fences when dropped, so unwinding cannot skip them
struct Completion<'a>(&'a Submission);

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        // The list reads as complete before any waiter on the user fence wakes
        self.0.done.signal();
        if let Some(fence) = &self.0.fence {
            fence.signal();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

impl SoftExecutor {
    pub fn new(worker_threads: usize, sink: Arc<DebugSink>) -> Result<Self> {
        let workers = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads.max(1))
            .thread_name(|i| format!("pulse-soft-{}", i))
            .build()
            .map_err(|e| {
                log::error!("Failed to start CPU workers: {}", e);
                Error::InitializationFailed
            })?;

        let shared = Arc::new(Shared {
            workers,
            in_flight: AtomicUsize::new(0),
            dispatch_serial: AtomicU64::new(0),
            sink,
        });

        let (sender, receiver) = mpsc::channel();
        let queue_shared = shared.clone();
        let queue = thread::Builder::new()
            .name("pulse-soft-queue".to_string())
            .spawn(move || queue_loop(&queue_shared, receiver))
            .map_err(|e| {
                log::error!("Failed to start CPU queue thread: {}", e);
                Error::InitializationFailed
            })?;

        log::info!("CPU executor running {} worker threads", worker_threads.max(1));

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            queue: Mutex::new(Some(queue)),
        })
    }

    pub(crate) fn submit(&self, submission: Submission) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(Error::DeviceLost)?;
        sender.send(submission).map_err(|_| Error::DeviceLost)
    }

    /// Workgroups currently queued or running on the worker pool
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for SoftExecutor {
    fn drop(&mut self) {
        // Closing the channel lets the queue thread finish pending work and exit
        self.sender.lock().take();
        if let Some(queue) = self.queue.lock().take() {
            if queue.join().is_err() {
                log::error!("CPU queue thread panicked");
            }
        }
    }
}

fn queue_loop(shared: &Shared, receiver: Receiver<Submission>) {
    for submission in receiver {
        let _completion = Completion(&submission);
        let baseline = shared.in_flight.load(Ordering::Acquire);

        for command in &submission.commands {
            match panic::catch_unwind(AssertUnwindSafe(|| execute(shared, command))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => shared.sink.error(format!("CPU command failed: {:#}", e)),
                Err(payload) => shared
                    .sink
                    .error(format!("CPU command panicked: {}", panic_message(&*payload))),
            }
        }

        while shared.in_flight.load(Ordering::Acquire) > baseline {
            thread::yield_now();
        }
    }
    log::debug!("CPU queue thread exiting");
}

fn execute(shared: &Shared, command: &SoftCommand) -> anyhow::Result<()> {
    match command {
        SoftCommand::Dispatch { pipeline, groups, size } => {
            let counts = match size {
                SoftDispatchSize::Direct(counts) => *counts,
                SoftDispatchSize::Indirect { memory, offset } => [
                    memory.load_u32(*offset),
                    memory.load_u32(*offset + 4),
                    memory.load_u32(*offset + 8),
                ],
            };
            dispatch(shared, pipeline, groups, counts)
        }
        SoftCommand::CopyBufferToBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => {
            dst.write(*dst_offset, &src.read_vec(*src_offset, *size));
            Ok(())
        }
        SoftCommand::CopyBufferToImage {
            src,
            offset,
            dst,
            region,
        } => {
            let bytes = src.read_vec(*offset, region.texel_count() * dst.texel_size());
            dst.write_region(region, &bytes);
            Ok(())
        }
        SoftCommand::CopyImageToBuffer {
            src,
            region,
            dst,
            offset,
        } => {
            dst.write(*offset, &src.read_region(region));
            Ok(())
        }
        SoftCommand::BlitImage {
            src,
            src_region,
            dst,
            dst_region,
        } => {
            src.blit(src_region, dst, dst_region);
            Ok(())
        }
    }
}

fn dispatch(
    shared: &Shared,
    pipeline: &SoftPipeline,
    groups: &[Option<SoftGroup>; 3],
    counts: [u32; 3],
) -> anyhow::Result<()> {
    let total = counts[0] as u64 * counts[1] as u64 * counts[2] as u64;
    if total == 0 {
        return Ok(());
    }
    anyhow::ensure!(total <= u32::MAX as u64, "dispatch of {:?} workgroups is too large", counts);

    let serial = shared.dispatch_serial.fetch_add(1, Ordering::Relaxed);
    let fault: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    shared.in_flight.fetch_add(total as usize, Ordering::AcqRel);
    shared.workers.install(|| {
        (0..total as u32).into_par_iter().for_each(|index| {
            let _guard = InFlight(&shared.in_flight);
            if fault.lock().is_some() {
                return;
            }

            let workgroup_id = [
                index % counts[0],
                (index / counts[0]) % counts[1],
                index / (counts[0] * counts[1]),
            ];
            let ctx = ExecContext {
                groups,
                shared: &pipeline.shared,
                workgroup: WorkgroupKey { dispatch: serial, index },
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                run_workgroup(&pipeline.program, pipeline.local_size, workgroup_id, counts, &ctx)
            }))
            .unwrap_or_else(|payload| Err(anyhow::anyhow!("panicked: {}", panic_message(&*payload))));
            if let Err(e) = result {
                fault.lock().get_or_insert(e.context(format!("workgroup {:?}", workgroup_id)));
            }
        });
    });

    match fault.into_inner() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
