//! Motor record adapter (`.VAL`, `.RBV`, `.DMOV`, `.VELO`, `.STOP`).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::channel::{wait_for_value, ChannelAccess, ChannelValue};
use crate::error::FlyscanResult;
use crate::hardware::capabilities::{Device, Movable, Stageable, VelocityControl};

/// Motor driven through a motor record
pub struct ChannelMotor {
    name: String,
    record: String,
    channels: Arc<dyn ChannelAccess>,
    move_timeout: Duration,
    staged_velocity: Mutex<Option<f64>>,
    original_velocity: Mutex<Option<f64>>,
}

impl ChannelMotor {
    /// Motor for the record `record` (e.g. `4idd:m1`)
    pub fn new(
        name: impl Into<String>,
        record: impl Into<String>,
        channels: Arc<dyn ChannelAccess>,
        move_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            record: record.into(),
            channels,
            move_timeout,
            staged_velocity: Mutex::new(None),
            original_velocity: Mutex::new(None),
        }
    }

    fn field(&self, field: &str) -> String {
        format!("{}.{}", self.record, field)
    }
}

impl Device for ChannelMotor {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_names(&self) -> Vec<String> {
        ["VAL", "RBV", "DMOV", "VELO", "STOP"]
            .iter()
            .map(|f| self.field(f))
            .collect()
    }
}

#[async_trait]
impl Movable for ChannelMotor {
    async fn move_abs(&self, position: f64) -> FlyscanResult<()> {
        self.channels
            .put(&self.field("VAL"), ChannelValue::Float(position))
            .await?;
        Ok(())
    }

    async fn position(&self) -> FlyscanResult<f64> {
        Ok(self.channels.get_f64(&self.field("RBV")).await?)
    }

    async fn wait_settled(&self) -> FlyscanResult<()> {
        wait_for_value(
            self.channels.as_ref(),
            &self.field("DMOV"),
            self.move_timeout,
            |v| v.as_i64() == Some(1),
        )
        .await?;
        Ok(())
    }

    async fn stop(&self) -> FlyscanResult<()> {
        self.channels
            .put(&self.field("STOP"), ChannelValue::Int(1))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl VelocityControl for ChannelMotor {
    async fn set_velocity(&self, velocity: f64) -> FlyscanResult<()> {
        self.channels
            .put(&self.field("VELO"), ChannelValue::Float(velocity))
            .await?;
        Ok(())
    }

    async fn velocity(&self) -> FlyscanResult<f64> {
        Ok(self.channels.get_f64(&self.field("VELO")).await?)
    }

    fn stage_velocity(&self, velocity: Option<f64>) {
        *self.staged_velocity.lock() = velocity;
    }
}

#[async_trait]
impl Stageable for ChannelMotor {
    async fn stage(&self) -> FlyscanResult<()> {
        let staged = *self.staged_velocity.lock();
        if let Some(velocity) = staged {
            let original = self.velocity().await?;
            *self.original_velocity.lock() = Some(original);
            self.set_velocity(velocity).await?;
            debug!(motor = %self.name, original, velocity, "Flying velocity applied");
        }
        Ok(())
    }

    async fn unstage(&self) -> FlyscanResult<()> {
        let original = self.original_velocity.lock().take();
        *self.staged_velocity.lock() = None;
        if let Some(velocity) = original {
            if let Err(e) = self.set_velocity(velocity).await {
                warn!(motor = %self.name, error = %e, "Failed to restore velocity");
                return Err(e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannelLayer;
    use crate::hardware::mock::{self, MotorSimOptions};

    #[tokio::test]
    async fn move_and_wait_reaches_target() {
        let sim = SimChannelLayer::new();
        mock::install_motor(&sim, "m:x", MotorSimOptions::default());
        let motor = ChannelMotor::new("x", "m:x", Arc::new(sim), Duration::from_secs(2));

        motor.move_and_wait(1.25).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 1.25);
    }

    #[tokio::test]
    async fn staged_velocity_is_restored() {
        let sim = SimChannelLayer::new();
        mock::install_motor(&sim, "m:x", MotorSimOptions::default());
        let motor = ChannelMotor::new("x", "m:x", Arc::new(sim.clone()), Duration::from_secs(2));
        let original = motor.velocity().await.unwrap();

        motor.stage_velocity(Some(0.25));
        motor.stage().await.unwrap();
        assert_eq!(motor.velocity().await.unwrap(), 0.25);

        motor.unstage().await.unwrap();
        assert_eq!(motor.velocity().await.unwrap(), original);

        // nothing staged, nothing restored
        let puts = sim.puts_to("m:x.VELO").len();
        motor.stage().await.unwrap();
        motor.unstage().await.unwrap();
        assert_eq!(sim.puts_to("m:x.VELO").len(), puts);
    }
}
