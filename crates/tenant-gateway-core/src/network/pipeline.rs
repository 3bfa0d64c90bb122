//! Per-connection stage chain.
//!
//! Every connection starts with the stages
//! `tenancy-resolver → device-topic-decoder → device-adapter`. Tenancy
//! resolution inserts the tenant's frame decoder under
//! [`TENANT_FRAME_DECODER`] directly before [`DEVICE_TOPIC_DECODER`], once.

use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::{Frame, FrameDecoder};
use crate::error::{FrameError, PipelineError};
use crate::tenancy::TenancyContext;

pub const TENANCY_RESOLVER: &str = "tenancy-resolver";
pub const TENANT_FRAME_DECODER: &str = "tenant-frame-decoder";
pub const DEVICE_TOPIC_DECODER: &str = "device-topic-decoder";
pub const DEVICE_ADAPTER: &str = "device-adapter";

/// One named stage.
#[derive(Debug)]
pub enum Stage {
    TenancyResolver,
    FrameDecoder(FrameDecoder),
    DeviceTopicDecoder,
    DeviceAdapter,
}

/// Ordered stage list plus the tenancy bound to the connection.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<(String, Stage)>,
    tenancy: Option<Arc<TenancyContext>>,
}

impl Pipeline {
    /// The default stage chain, without a frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            stages: vec![
                (TENANCY_RESOLVER.to_string(), Stage::TenancyResolver),
                (DEVICE_TOPIC_DECODER.to_string(), Stage::DeviceTopicDecoder),
                (DEVICE_ADAPTER.to_string(), Stage::DeviceAdapter),
            ],
            tenancy: None,
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.stages.iter().any(|(n, _)| n == name)
    }

    /// Stage names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|(n, _)| n.as_str())
    }

    /// Insert `stage` directly before the stage named `anchor`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicateStage`] if `name` is already present,
    /// or [`PipelineError::StageNotFound`] if `anchor` is missing.
    pub fn insert_before(
        &mut self,
        anchor: &str,
        name: &str,
        stage: Stage,
    ) -> Result<(), PipelineError> {
        if self.contains(name) {
            return Err(PipelineError::DuplicateStage(name.to_string()));
        }
        let index = self
            .stages
            .iter()
            .position(|(n, _)| n == anchor)
            .ok_or_else(|| PipelineError::StageNotFound(anchor.to_string()))?;
        self.stages.insert(index, (name.to_string(), stage));
        Ok(())
    }

    /// The installed tenant frame decoder, if any.
    pub fn frame_decoder_mut(&mut self) -> Option<&mut FrameDecoder> {
        self.stages.iter_mut().find_map(|(_, stage)| match stage {
            Stage::FrameDecoder(decoder) => Some(decoder),
            _ => None,
        })
    }

    #[must_use]
    pub fn tenancy(&self) -> Option<&Arc<TenancyContext>> {
        self.tenancy.as_ref()
    }

    pub fn set_tenancy(&mut self, tenancy: Arc<TenancyContext>) {
        self.tenancy = Some(tenancy);
    }

    /// Run the installed frame decoder over `src`.
    ///
    /// Returns `Ok(None)` when no decoder is installed yet or more input is needed.
    ///
    /// # Errors
    ///
    /// Propagates the decoder's [`FrameError`].
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match self.frame_decoder_mut() {
            Some(decoder) => decoder.decode(src),
            None => Ok(None),
        }
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}
