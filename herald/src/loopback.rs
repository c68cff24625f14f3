//! A transport that delivers to itself
//!
//! Every step succeeds after a configurable delay, reporting progress as it
//! goes. Useful for trying out channel chains and configuration without a
//! real remote side.

use std::time::Duration;

use async_trait::async_trait;
use herald_common::transport;
use herald_delivery::{
    ChannelSettings, DeliveryError, StepContext, StepDescriptor, StepKind, StepOutput, Transport,
};
use serde::Deserialize;

mod defaults {
    pub const fn latency_ms() -> u64 {
        25
    }

    pub const fn progress_ticks() -> u32 {
        4
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopbackConfig {
    /// How long each step takes
    ///
    /// Default: 25ms
    #[serde(default = "defaults::latency_ms")]
    pub latency_ms: u64,

    /// Progress reports per step
    ///
    /// Default: 4
    #[serde(default = "defaults::progress_ticks")]
    pub progress_ticks: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            latency_ms: defaults::latency_ms(),
            progress_ticks: defaults::progress_ticks(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    config: LoopbackConfig,
}

impl LoopbackTransport {
    #[must_use]
    pub const fn new(config: LoopbackConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn init(&self, settings: &ChannelSettings) -> Result<(), DeliveryError> {
        transport!(
            level = DEBUG,
            "Loopback transport ready (endpoint: {})",
            settings.endpoint.as_deref().unwrap_or("loopback")
        );
        Ok(())
    }

    async fn execute(
        &self,
        step: &StepDescriptor,
        ctx: &StepContext<'_>,
    ) -> Result<StepOutput, DeliveryError> {
        let ticks = self.config.progress_ticks.max(1);
        let pause = Duration::from_millis(self.config.latency_ms) / ticks;

        for tick in 1..=ticks {
            tokio::time::sleep(pause).await;
            #[allow(clippy::cast_precision_loss)]
            let fraction = tick as f32 / ticks as f32;
            ctx.report_progress(fraction);
        }

        let endpoint = ctx.settings().endpoint.as_deref().unwrap_or("loopback");
        let message = ctx.message();

        Ok(match &step.kind {
            StepKind::Confirm => StepOutput::confirmed([message.recipient.address.clone()]),
            kind if step.artifact.is_some() => {
                StepOutput::artifact(format!("{endpoint}://{}/{kind}/{}", ctx.channel(), message.id))
            }
            _ => StepOutput::default(),
        })
    }
}
