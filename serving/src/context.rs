use std::sync::Arc;

use tracing::{info, instrument};

use crate::error::CoreError;
use crate::stream::{DeviceStream, StreamKind};

/// The fixed record of named streams one accelerator owns.
pub struct StreamSet {
    pub compute: DeviceStream,
    pub h2d: DeviceStream,
    pub d2h: DeviceStream,
    pub d2d: DeviceStream,
    pub mgmt: DeviceStream,
    pub collective: DeviceStream,
}

impl StreamSet {
    fn new(device_id: u32) -> Result<Self, CoreError> {
        Ok(Self {
            compute: DeviceStream::new(device_id, StreamKind::Compute)?,
            h2d: DeviceStream::new(device_id, StreamKind::H2d)?,
            d2h: DeviceStream::new(device_id, StreamKind::D2h)?,
            d2d: DeviceStream::new(device_id, StreamKind::D2d)?,
            mgmt: DeviceStream::new(device_id, StreamKind::Mgmt)?,
            collective: DeviceStream::new(device_id, StreamKind::Collective)?,
        })
    }
}

impl Drop for StreamSet {
    fn drop(&mut self) {
        // Streams are destroyed in reverse construction order.
        self.collective.destroy();
        self.mgmt.destroy();
        self.d2d.destroy();
        self.d2h.destroy();
        self.h2d.destroy();
        self.compute.destroy();
    }
}

/// Collective-communication state for tensor parallelism: one rank per
/// accelerator on this host, rank id = accelerator index.
#[derive(Debug)]
pub struct CommunicatorGroup {
    world_size: usize,
}

impl CommunicatorGroup {
    fn init(world_size: usize) -> Result<Self, CoreError> {
        info!(world_size, "initializing collective communicator group");
        Ok(Self { world_size })
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn rank_of(&self, device_id: u32) -> usize {
        device_id as usize
    }
}

/// Per-process accelerator context: one stream set per accelerator plus
/// the collective state shared by the tensor-parallel ranks.
pub struct Context {
    tensor_parallel_size: usize,
    pipeline_parallel_size: usize,
    streams: Vec<Arc<StreamSet>>,
    communicators: CommunicatorGroup,
}

impl Context {
    #[instrument]
    pub fn new(tensor_parallel_size: usize, pipeline_parallel_size: usize) -> Result<Self, CoreError> {
        if tensor_parallel_size == 0 {
            return Err(CoreError::InvalidArgument(
                "tensor_para_size must be positive".into(),
            ));
        }
        if pipeline_parallel_size != 1 {
            return Err(CoreError::InvalidArgument(format!(
                "only pipeline_para_size == 1 is supported, got {pipeline_parallel_size}"
            )));
        }

        let mut streams = Vec::with_capacity(tensor_parallel_size);
        for device_id in 0..tensor_parallel_size as u32 {
            streams.push(Arc::new(StreamSet::new(device_id)?));
        }
        let communicators = CommunicatorGroup::init(tensor_parallel_size)?;

        Ok(Self {
            tensor_parallel_size,
            pipeline_parallel_size,
            streams,
            communicators,
        })
    }

    pub fn device_count(&self) -> usize {
        self.tensor_parallel_size
    }

    pub fn pipeline_parallel_size(&self) -> usize {
        self.pipeline_parallel_size
    }

    pub fn streams(&self, device_id: u32) -> &Arc<StreamSet> {
        &self.streams[device_id as usize]
    }

    pub fn communicators(&self) -> &CommunicatorGroup {
        &self.communicators
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Streams are destroyed in reverse construction order.
        while self.streams.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_parallelism_is_rejected() {
        assert!(Context::new(1, 2).is_err());
        assert!(Context::new(0, 1).is_err());
    }

    #[test]
    fn one_stream_set_per_device() {
        let context = Context::new(2, 1).unwrap();
        assert_eq!(context.device_count(), 2);
        assert_eq!(context.streams(0).compute.device_id(), 0);
        assert_eq!(context.streams(1).d2h.device_id(), 1);
        assert_eq!(context.communicators().rank_of(1), 1);
    }
}
