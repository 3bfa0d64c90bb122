//! Tenant lookup and one-time decoder installation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::auth::PeerIdentity;
use crate::bridge::BridgeFactory;
use crate::codec::FrameFormat;
use crate::config::TenantConfig;
use crate::error::PipelineError;
use crate::network::pipeline::{Pipeline, Stage, DEVICE_TOPIC_DECODER, TENANT_FRAME_DECODER};
use crate::packet::BufferLedger;

use super::context::{TenancyContext, TenantInfo, TrustInfo};

/// Static tenant settings for one certificate subject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantProfile {
    pub tenant_id: String,
    pub tenant_name: String,
    pub format: FrameFormat,
}

/// Certificate subject → tenant profile, read-only after startup.
#[derive(Debug, Clone, Default)]
pub struct TenantTable {
    by_subject: HashMap<String, TenantProfile>,
}

impl TenantTable {
    #[must_use]
    pub fn from_config(tenants: &[TenantConfig]) -> Self {
        let by_subject = tenants
            .iter()
            .map(|tenant| {
                (
                    tenant.subject.clone(),
                    TenantProfile {
                        tenant_id: tenant.tenant_id.clone(),
                        tenant_name: tenant.tenant_name().to_string(),
                        format: tenant.frame_format(),
                    },
                )
            })
            .collect();
        Self { by_subject }
    }

    #[must_use]
    pub fn get(&self, subject: &str) -> Option<&TenantProfile> {
        self.by_subject.get(subject)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_subject.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_subject.is_empty()
    }
}

/// Resolves a connection's tenancy and installs its frame decoder.
#[derive(Debug, Clone)]
pub struct TenancyResolver {
    table: Arc<TenantTable>,
    bridges: Arc<dyn BridgeFactory>,
    max_message_size: usize,
    ledger: BufferLedger,
}

impl TenancyResolver {
    #[must_use]
    pub fn new(
        table: Arc<TenantTable>,
        bridges: Arc<dyn BridgeFactory>,
        max_message_size: usize,
        ledger: BufferLedger,
    ) -> Self {
        Self {
            table,
            bridges,
            max_message_size,
            ledger,
        }
    }

    /// Pure table lookup. Unknown or absent subjects give the delayed
    /// self-identifying tenancy.
    #[must_use]
    pub fn lookup(&self, peer: Option<&PeerIdentity>) -> TenancyContext {
        let matched = peer.and_then(|peer| self.table.get(&peer.subject).map(|p| (peer, p)));
        match matched {
            Some((peer, profile)) => TenancyContext::fixed(
                TenantInfo {
                    tenant_id: profile.tenant_id.clone(),
                    tenant_name: profile.tenant_name.clone(),
                    trust: TrustInfo::Certificate {
                        subject: peer.subject.clone(),
                        thumbprint: peer.thumbprint.clone(),
                    },
                },
                profile.format,
                self.max_message_size,
                Arc::clone(&self.bridges),
            ),
            None => {
                if let Some(peer) = peer {
                    debug!(subject = %peer.subject, "Unknown certificate subject, tenant from content");
                }
                TenancyContext::delayed(self.max_message_size, Arc::clone(&self.bridges))
            }
        }
    }

    /// Resolve the tenancy for a connection and install its decoder.
    ///
    /// Only the first call on a pipeline has any effect; later calls return
    /// the tenancy already bound.
    ///
    /// # Errors
    ///
    /// Returns a [`PipelineError`] if the stage chain lacks the topic decoder
    /// or a decoder is installed without a tenancy.
    pub fn resolve(
        &self,
        peer: Option<&PeerIdentity>,
        pipeline: &mut Pipeline,
    ) -> Result<Arc<TenancyContext>, PipelineError> {
        if pipeline.contains(TENANT_FRAME_DECODER) {
            return pipeline.tenancy().cloned().ok_or(PipelineError::MissingTenancy);
        }

        let tenancy = Arc::new(self.lookup(peer));
        let decoder = tenancy.frame_decoder(self.ledger.clone());
        pipeline.insert_before(
            DEVICE_TOPIC_DECODER,
            TENANT_FRAME_DECODER,
            Stage::FrameDecoder(decoder),
        )?;
        pipeline.set_tenancy(Arc::clone(&tenancy));

        info!(
            tenant_id = %tenancy.tenant_id(),
            delayed = tenancy.is_delayed(),
            format = ?tenancy.format(),
            "Tenancy resolved"
        );
        Ok(tenancy)
    }
}
