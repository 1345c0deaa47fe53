//! Scalar readouts (scaler channels, amplifier monitors) read once per path step.

use async_trait::async_trait;
use std::sync::Arc;

use crate::channel::ChannelAccess;
use crate::error::FlyscanResult;
use crate::hardware::capabilities::{Device, Readable};

/// A single numeric channel
pub struct ChannelReadout {
    name: String,
    pv: String,
    channels: Arc<dyn ChannelAccess>,
}

impl ChannelReadout {
    /// Readout named `name` over channel `pv`
    pub fn new(name: impl Into<String>, pv: impl Into<String>, channels: Arc<dyn ChannelAccess>) -> Self {
        Self {
            name: name.into(),
            pv: pv.into(),
            channels,
        }
    }
}

impl Device for ChannelReadout {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_names(&self) -> Vec<String> {
        vec![self.pv.clone()]
    }
}

#[async_trait]
impl Readable for ChannelReadout {
    async fn read(&self) -> FlyscanResult<f64> {
        Ok(self.channels.get_f64(&self.pv).await?)
    }
}
