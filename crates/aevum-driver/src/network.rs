//! Network (loaded model) handles.
//!
//! A network is either a DMA-resident blob of caller-supplied weights,
//! copied into the carveout at creation, or an index naming a model baked
//! into the firmware. Exactly one representation exists per network; the
//! enum makes the invariant structural.

use std::sync::Arc;

use aevum_proto::{NetworkRef, WireBuffer};
use tracing::debug;

use crate::device::DeviceShared;
use crate::dma::DmaRegion;
use crate::error::{AevumError, Result};

/// How to create a network.
#[derive(Debug, Clone, Copy)]
pub enum NetworkSpec<'a> {
    /// Caller-supplied weights; the bytes are copied into DMA memory and
    /// the original slice is not retained.
    UserBuffer(&'a [u8]),
    /// Index into the firmware's built-in models.
    Index(u32),
}

/// A reference-counted handle to a loaded model.
#[derive(Debug, Clone)]
pub struct Network {
    pub(crate) inner: Arc<NetworkInner>,
}

#[derive(Debug)]
pub(crate) struct NetworkInner {
    pub(crate) shared: Arc<DeviceShared>,
    model: Model,
}

#[derive(Debug)]
enum Model {
    Buffer(DmaRegion),
    Index(u32),
}

impl Network {
    pub(crate) fn create(shared: Arc<DeviceShared>, spec: NetworkSpec<'_>) -> Result<Self> {
        let model = match spec {
            NetworkSpec::UserBuffer(data) => {
                if data.is_empty() {
                    return Err(AevumError::invalid_argument("empty network data"));
                }
                let region = shared.dma.alloc(data.len())?;
                region
                    .write_at(0, data)
                    .map_err(|e| AevumError::faulted(format!("copying network data: {e}")))?;
                Model::Buffer(region)
            }
            NetworkSpec::Index(index) => Model::Index(index),
        };

        match &model {
            Model::Buffer(region) => debug!(
                "Network create. device_addr={:#x}, size={}",
                region.device_addr(),
                region.size()
            ),
            Model::Index(index) => debug!("Network create. index={index}"),
        }

        Ok(Self {
            inner: Arc::new(NetworkInner { shared, model }),
        })
    }

    /// The firmware-side model index, if this network refers to one.
    pub fn firmware_index(&self) -> Option<u32> {
        match self.inner.model {
            Model::Index(index) => Some(index),
            Model::Buffer(_) => None,
        }
    }

    /// Number of live handles, inferences included. Diagnostics only.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl NetworkInner {
    /// The network's wire representation for request payloads.
    pub(crate) fn wire_ref(&self) -> NetworkRef {
        match &self.model {
            Model::Buffer(region) => NetworkRef::Buffer(WireBuffer {
                ptr: region.device_addr() as u32,
                size: region.size() as u32,
            }),
            Model::Index(index) => NetworkRef::Index(*index),
        }
    }
}
