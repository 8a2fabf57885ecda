use std::fmt;
use std::ptr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, trace};

use crate::error::CoreError;
use crate::memory::region::MemoryRegion;

/// The six logical streams every accelerator owns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Compute,
    H2d,
    D2h,
    D2d,
    Mgmt,
    Collective,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamKind::Compute => "compute",
            StreamKind::H2d => "h2d",
            StreamKind::D2h => "d2h",
            StreamKind::D2d => "d2d",
            StreamKind::Mgmt => "mgmt",
            StreamKind::Collective => "collective",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct EventState {
    fired: Mutex<bool>,
    cond: Condvar,
}

/// A recordable completion marker on a stream.
///
/// Submissions on one stream are FIFO, so an event recorded after a set
/// of copies fires only once those copies have executed. Cross-stream
/// ordering is established exclusively through events; no per-stream
/// side effect may be relied on across streams.
#[derive(Clone, Debug)]
pub struct DeviceEvent(Arc<EventState>);

impl DeviceEvent {
    fn new() -> Self {
        Self(Arc::new(EventState::default()))
    }

    /// Non-blocking completion check.
    pub fn query(&self) -> bool {
        *self.0.fired.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks the calling thread until the event fires. Called from the
    /// swap supervision pool and from stream workers, never from the
    /// scheduler task.
    pub fn wait(&self) {
        let mut fired = self.0.fired.lock().unwrap_or_else(|e| e.into_inner());
        while !*fired {
            let (guard, _) = self
                .0
                .cond
                .wait_timeout(fired, Duration::from_millis(100))
                .unwrap_or_else(|e| e.into_inner());
            fired = guard;
        }
    }

    fn fire(&self) {
        let mut fired = self.0.fired.lock().unwrap_or_else(|e| e.into_inner());
        *fired = true;
        self.0.cond.notify_all();
    }
}

/// An asynchronous byte copy between two reservations.
///
/// The task owns `Arc` handles to both reservations so the memory stays
/// alive until the copy has executed, whatever the submitting side does
/// with its block ids in the meantime.
pub struct CopyTask {
    pub src: *const u8,
    pub dst: *mut u8,
    pub len: usize,
    pub src_region: Arc<MemoryRegion>,
    pub dst_region: Arc<MemoryRegion>,
}

// SAFETY: the raw pointers target the held reservations, which are kept
// alive by the Arc fields; the stream worker is the only thread that
// dereferences them, and event ordering prevents concurrent writers.
unsafe impl Send for CopyTask {}

enum StreamOp {
    Copy(CopyTask),
    Record(DeviceEvent),
    Wait(DeviceEvent),
}

/// One logical device stream: a FIFO queue of copy and event operations
/// executed by a dedicated worker thread.
pub struct DeviceStream {
    kind: StreamKind,
    device_id: u32,
    sender: Option<UnboundedSender<StreamOp>>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceStream {
    pub(crate) fn new(device_id: u32, kind: StreamKind) -> Result<Self, CoreError> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<StreamOp>();
        let worker = thread::Builder::new()
            .name(format!("stream-d{device_id}-{kind}"))
            .spawn(move || {
                while let Some(op) = receiver.blocking_recv() {
                    match op {
                        StreamOp::Copy(task) => {
                            // SAFETY: see `CopyTask`.
                            unsafe { ptr::copy_nonoverlapping(task.src, task.dst, task.len) };
                        }
                        StreamOp::Record(event) => event.fire(),
                        StreamOp::Wait(event) => event.wait(),
                    }
                }
            })
            .map_err(|e| CoreError::Runtime(format!("failed to spawn stream worker: {e}")))?;
        Ok(Self {
            kind,
            device_id,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Enqueues an asynchronous copy. Returns immediately; completion is
    /// observed through a subsequently recorded event.
    pub fn submit_copy(&self, task: CopyTask) -> Result<(), CoreError> {
        trace!(
            device = self.device_id,
            stream = %self.kind,
            len = task.len,
            "submit copy"
        );
        self.send(StreamOp::Copy(task))
    }

    /// Records an event that fires once everything submitted so far has
    /// executed.
    pub fn record_event(&self) -> Result<DeviceEvent, CoreError> {
        let event = DeviceEvent::new();
        self.send(StreamOp::Record(event.clone()))?;
        Ok(event)
    }

    /// Makes this stream wait for `event` before executing later
    /// submissions.
    pub fn wait_event(&self, event: &DeviceEvent) -> Result<(), CoreError> {
        self.send(StreamOp::Wait(event.clone()))
    }

    fn send(&self, op: StreamOp) -> Result<(), CoreError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| CoreError::Terminated("stream already destroyed".into()))?;
        sender.send(op).map_err(|_| {
            error!(device = self.device_id, stream = %self.kind, "stream worker is gone");
            CoreError::Terminated(format!("{} stream worker is gone", self.kind))
        })
    }

    /// Drains the FIFO and stops the worker by closing the channel.
    /// Idempotent; later submissions fail with `Terminated`. The
    /// context uses this to destroy a stream set in reverse
    /// construction order.
    pub(crate) fn destroy(&mut self) {
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for DeviceStream {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemoryTier;

    #[test]
    fn copies_on_one_stream_are_fifo() {
        let src = Arc::new(MemoryRegion::reserve(64, MemoryTier::Host, None).unwrap());
        let dst = Arc::new(MemoryRegion::reserve(64, MemoryTier::Host, None).unwrap());
        // SAFETY: test-local regions, no concurrent access.
        unsafe {
            ptr::copy_nonoverlapping(b"abcd".as_ptr(), src.ptr_at(0).as_ptr(), 4);
        }

        let stream = DeviceStream::new(0, StreamKind::D2h).unwrap();
        stream
            .submit_copy(CopyTask {
                src: src.ptr_at(0).as_ptr(),
                dst: dst.ptr_at(0).as_ptr(),
                len: 4,
                src_region: src.clone(),
                dst_region: dst.clone(),
            })
            .unwrap();
        let event = stream.record_event().unwrap();
        event.wait();

        let mut out = [0u8; 4];
        // SAFETY: the copy is sequenced before the event.
        unsafe { ptr::copy_nonoverlapping(dst.ptr_at(0).as_ptr(), out.as_mut_ptr(), 4) };
        assert_eq!(&out, b"abcd");
    }

    #[test]
    fn cross_stream_ordering_via_event() {
        let a = DeviceStream::new(0, StreamKind::H2d).unwrap();
        let b = DeviceStream::new(0, StreamKind::Compute).unwrap();
        let event = a.record_event().unwrap();
        b.wait_event(&event).unwrap();
        let after = b.record_event().unwrap();
        after.wait();
        assert!(event.query());
    }
}
