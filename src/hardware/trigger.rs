//! Trigger generator adapter (softGlue-style pulse subsystem).
//!
//! A shared reference clock is divided down into a periodic pulse train that
//! drives the area-detector trigger line and the position-sampling clock.
//! Register values are integer tick counts of the reference clock:
//!
//! ```text
//! divisor = clock × period    width = clock × pulse_width    delay = clock × pulse_delay
//! ```
//!
//! When `clock × time` is not a whole number the fractional tick is
//! discarded (floor), so the effective period is slightly shorter than
//! requested. The lost time is reported by
//! [`TriggerRegisters::period_residue_s`] and logged; it is never silently
//! rounded up.
//!
//! Channels (relative to the prefix):
//!
//! | suffix            | meaning                                   |
//! |-------------------|-------------------------------------------|
//! | `Divisor`         | period in ticks                           |
//! | `Width`           | pulse width in ticks                      |
//! | `Delay`           | pulse delay in ticks                      |
//! | `PulseCount`      | pulses per burst, 0 = free run            |
//! | `Reset`           | counter reset line                        |
//! | `Enable`          | pulse subsystem enable                    |
//! | `DetGate`         | detector trigger gate                     |
//! | `PulsesOut_RBV`   | pulses generated since reset              |
//! | `DetTriggers_RBV` | pulses passed to detectors since reset    |

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, instrument, warn};

use crate::channel::{ChannelAccess, ChannelValue};
use crate::config::TriggerConfig;
use crate::error::{FlyscanError, FlyscanResult};
use crate::hardware::capabilities::Device;

/// A whole number of ticks is accepted when `clock × time` is this close to it
const TICK_TOLERANCE: f64 = 1e-6;

/// Longest wait [`TriggerGenerator::pending_pulse_drain_time`] returns
pub const MAX_DRAIN_TIME: Duration = Duration::from_secs(3600);

/// Requested pulse timing for one run
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerPlan {
    /// Pulse period, in seconds
    pub period: f64,
    /// Pulse width, in seconds
    pub pulse_width: f64,
    /// Delay of the pulse within its period, in seconds
    pub pulse_delay: f64,
    /// Reference clock frequency, in Hz
    pub reference_clock_hz: f64,
    /// Pulses per burst; 0 free-runs until disabled
    pub pulse_count: u64,
}

impl TriggerPlan {
    /// Validate and build a plan with no delay and a free-running train
    pub fn new(period: f64, pulse_width: f64, reference_clock_hz: f64) -> FlyscanResult<Self> {
        for (what, value) in [
            ("period", period),
            ("pulse width", pulse_width),
            ("reference clock", reference_clock_hz),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(FlyscanError::InvalidTriggerPlan(format!(
                    "{what} must be positive, got {value}"
                )));
            }
        }
        if pulse_width > period {
            return Err(FlyscanError::InvalidTriggerPlan(format!(
                "pulse width {pulse_width}s exceeds period {period}s"
            )));
        }

        let plan = Self {
            period,
            pulse_width,
            pulse_delay: 0.0,
            reference_clock_hz,
            pulse_count: 0,
        };
        let registers = plan.registers();
        if registers.divisor == 0 || registers.width == 0 {
            return Err(FlyscanError::InvalidTriggerPlan(format!(
                "period {period}s or width {pulse_width}s is shorter than one clock tick"
            )));
        }
        Ok(plan)
    }

    /// Set the pulse delay
    pub fn with_delay(mut self, pulse_delay: f64) -> FlyscanResult<Self> {
        if !pulse_delay.is_finite() || pulse_delay < 0.0 || pulse_delay >= self.period {
            return Err(FlyscanError::InvalidTriggerPlan(format!(
                "pulse delay {pulse_delay}s must be within [0, {})",
                self.period
            )));
        }
        self.pulse_delay = pulse_delay;
        Ok(self)
    }

    /// Stop after `pulse_count` pulses
    pub fn with_pulse_count(mut self, pulse_count: u64) -> Self {
        self.pulse_count = pulse_count;
        self
    }

    /// Register values for this plan
    pub fn registers(&self) -> TriggerRegisters {
        TriggerRegisters {
            divisor: ticks(self.period, self.reference_clock_hz),
            width: ticks(self.pulse_width, self.reference_clock_hz),
            delay: ticks(self.pulse_delay, self.reference_clock_hz),
            pulse_count: self.pulse_count,
            reference_clock_hz: self.reference_clock_hz,
            requested_period: self.period,
        }
    }
}

fn ticks(seconds: f64, clock: f64) -> u64 {
    let exact = seconds * clock;
    let nearest = exact.round();
    let whole = if (exact - nearest).abs() <= TICK_TOLERANCE {
        nearest
    } else {
        exact.floor()
    };
    whole.max(0.0) as u64
}

/// Integer register values programmed into the pulse subsystem
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerRegisters {
    /// Period in reference-clock ticks
    pub divisor: u64,
    /// Pulse width in ticks
    pub width: u64,
    /// Pulse delay in ticks
    pub delay: u64,
    /// Pulses per burst, 0 = free run
    pub pulse_count: u64,
    /// Reference clock frequency, in Hz
    pub reference_clock_hz: f64,
    /// Period that was asked for, in seconds
    pub requested_period: f64,
}

impl TriggerRegisters {
    /// Period actually generated, in seconds
    pub fn effective_period(&self) -> f64 {
        self.divisor as f64 / self.reference_clock_hz
    }

    /// Pulse width actually generated, in seconds
    pub fn effective_width(&self) -> f64 {
        self.width as f64 / self.reference_clock_hz
    }

    /// Pulse delay actually generated, in seconds
    pub fn effective_delay(&self) -> f64 {
        self.delay as f64 / self.reference_clock_hz
    }

    /// Requested period minus effective period; each pulse drifts by this much
    pub fn period_residue_s(&self) -> f64 {
        self.requested_period - self.effective_period()
    }
}

/// Pulse counters read back from the subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PulseCounters {
    /// Pulses generated since the last reset
    pub pulses_out: u64,
    /// Pulses passed through the detector gate since the last reset
    pub detector_triggers: u64,
}

/// Exclusive ownership of a trigger generator for one flyscan
pub struct TriggerLease {
    _guard: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for TriggerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TriggerLease")
    }
}

/// Adapter over the pulse-generation subsystem
pub struct TriggerGenerator {
    name: String,
    prefix: String,
    channels: Arc<dyn ChannelAccess>,
    reference_clock_hz: f64,
    reset_settle: Duration,
    drain_margin_s: f64,
    last_configured: Mutex<Option<TriggerRegisters>>,
    lease: Arc<tokio::sync::Mutex<()>>,
}

impl TriggerGenerator {
    /// Adapter for the subsystem at `prefix`
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        channels: Arc<dyn ChannelAccess>,
        config: &TriggerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            channels,
            reference_clock_hz: config.reference_clock_hz,
            reset_settle: Duration::from_secs_f64(config.reset_settle_s),
            drain_margin_s: config.drain_margin_s,
            last_configured: Mutex::new(None),
            lease: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Full channel name for a register suffix
    pub fn pv(&self, suffix: &str) -> String {
        format!("{}{}", self.prefix, suffix)
    }

    /// Reference clock frequency, in Hz
    pub fn reference_clock_hz(&self) -> f64 {
        self.reference_clock_hz
    }

    /// Build a plan against this generator's reference clock
    pub fn plan(&self, period: f64, pulse_width: f64, pulse_delay: f64) -> FlyscanResult<TriggerPlan> {
        TriggerPlan::new(period, pulse_width, self.reference_clock_hz)?.with_delay(pulse_delay)
    }

    /// Take exclusive ownership of the generator, or fail with `HardwareBusy`
    pub fn try_lease(&self) -> FlyscanResult<TriggerLease> {
        self.lease
            .clone()
            .try_lock_owned()
            .map(|guard| TriggerLease { _guard: guard })
            .map_err(|_| FlyscanError::HardwareBusy)
    }

    /// Compute and program registers for `period`, `pulse_width` and `pulse_delay`.
    ///
    /// An invalid plan is rejected. A disconnected register is only logged;
    /// confirm the result with [`TriggerGenerator::verify`].
    pub async fn configure(
        &self,
        period: f64,
        pulse_width: f64,
        pulse_delay: f64,
    ) -> FlyscanResult<TriggerRegisters> {
        let plan = self.plan(period, pulse_width, pulse_delay)?;
        Ok(self.configure_plan(&plan).await)
    }

    /// Program registers for a validated plan
    #[instrument(skip(self, plan), fields(generator = %self.name))]
    pub async fn configure_plan(&self, plan: &TriggerPlan) -> TriggerRegisters {
        let registers = plan.registers();
        let residue = registers.period_residue_s();
        if residue > 0.0 {
            warn!(
                requested = plan.period,
                effective = registers.effective_period(),
                residue_s = residue,
                "Trigger period is not a whole number of clock ticks"
            );
        }

        let writes = [
            ("Divisor", registers.divisor),
            ("Width", registers.width),
            ("Delay", registers.delay),
            ("PulseCount", registers.pulse_count),
        ];
        for (suffix, value) in writes {
            let pv = self.pv(suffix);
            if let Err(e) = self.channels.put(&pv, ChannelValue::from(value)).await {
                warn!(pv = %pv, error = %e, "Trigger register write failed");
            }
        }

        *self.last_configured.lock() = Some(registers);
        debug!(?registers, "Trigger configured");
        registers
    }

    /// Read the programmed registers back
    pub async fn read_back(&self) -> FlyscanResult<TriggerRegisters> {
        let read = |suffix: &'static str| {
            let pv = self.pv(suffix);
            async move {
                let value = self.channels.get_i64(&pv).await?;
                Ok::<u64, FlyscanError>(u64::try_from(value).unwrap_or(0))
            }
        };
        let divisor = read("Divisor").await?;
        let width = read("Width").await?;
        let delay = read("Delay").await?;
        let pulse_count = read("PulseCount").await?;

        let last = *self.last_configured.lock();
        let requested_period = last
            .map(|r| r.requested_period)
            .unwrap_or(divisor as f64 / self.reference_clock_hz);

        Ok(TriggerRegisters {
            divisor,
            width,
            delay,
            pulse_count,
            reference_clock_hz: self.reference_clock_hz,
            requested_period,
        })
    }

    /// Read back and compare against `expected`
    pub async fn verify(&self, expected: &TriggerRegisters) -> FlyscanResult<TriggerRegisters> {
        let actual = self.read_back().await?;
        let pairs = [
            ("Divisor", expected.divisor, actual.divisor),
            ("Width", expected.width, actual.width),
            ("Delay", expected.delay, actual.delay),
            ("PulseCount", expected.pulse_count, actual.pulse_count),
        ];
        for (suffix, want, got) in pairs {
            if want != got {
                return Err(FlyscanError::ReadbackMismatch {
                    register: self.pv(suffix),
                    expected: want.to_string(),
                    actual: got.to_string(),
                });
            }
        }
        Ok(actual)
    }

    /// Pulse the reset line to clear accumulated counters
    #[instrument(skip(self), fields(generator = %self.name))]
    pub async fn reset(&self) -> FlyscanResult<()> {
        let pv = self.pv("Reset");
        self.channels.put(&pv, ChannelValue::Int(1)).await?;
        tokio::time::sleep(self.reset_settle).await;
        self.channels.put(&pv, ChannelValue::Int(0)).await?;
        debug!("Trigger counters reset");
        Ok(())
    }

    /// Open the detector gate, then enable the pulse subsystem
    #[instrument(skip(self), fields(generator = %self.name))]
    pub async fn start(&self) -> FlyscanResult<()> {
        self.channels.put(&self.pv("DetGate"), ChannelValue::Int(1)).await?;
        self.channels.put(&self.pv("Enable"), ChannelValue::Int(1)).await?;
        info!("Trigger started");
        Ok(())
    }

    /// Close the detector trigger gate
    pub async fn stop_detector_gate(&self) -> FlyscanResult<()> {
        self.channels.put(&self.pv("DetGate"), ChannelValue::Int(0)).await?;
        Ok(())
    }

    /// Disable the pulse subsystem
    pub async fn stop_subsystem(&self) -> FlyscanResult<()> {
        self.channels.put(&self.pv("Enable"), ChannelValue::Int(0)).await?;
        Ok(())
    }

    /// Close the detector gate, then disable the subsystem.
    ///
    /// Both lines are always attempted; the first failure is returned.
    #[instrument(skip(self), fields(generator = %self.name))]
    pub async fn stop(&self) -> FlyscanResult<()> {
        let gate = self.stop_detector_gate().await;
        let subsystem = self.stop_subsystem().await;
        info!("Trigger stopped");
        gate.and(subsystem)
    }

    /// Time to wait after motion ends for buffered pulses to flush:
    /// `(divisor / clock) × points_per_packet + margin`.
    ///
    /// A packet size that is not finite, or a wait too long to represent,
    /// is clamped to [`MAX_DRAIN_TIME`].
    pub fn pending_pulse_drain_time(&self, points_per_packet: f64) -> Duration {
        let last = *self.last_configured.lock();
        let period = last.map(|r| r.effective_period()).unwrap_or(0.0);
        let seconds = period * points_per_packet.max(0.0) + self.drain_margin_s;
        match Duration::try_from_secs_f64(seconds.max(0.0)) {
            Ok(wait) => wait.min(MAX_DRAIN_TIME),
            Err(_) => {
                warn!(points_per_packet, "Drain time out of range, clamping");
                MAX_DRAIN_TIME
            }
        }
    }

    /// Registers programmed by the last `configure`
    pub fn last_configured(&self) -> Option<TriggerRegisters> {
        *self.last_configured.lock()
    }

    /// `(detector_gate_on, subsystem_enabled)`
    pub async fn gate_states(&self) -> FlyscanResult<(bool, bool)> {
        let gate = self.channels.get(&self.pv("DetGate")).await?.is_on();
        let enable = self.channels.get(&self.pv("Enable")).await?.is_on();
        Ok((gate, enable))
    }

    /// Pulse counters since the last reset
    pub async fn counters(&self) -> FlyscanResult<PulseCounters> {
        let pulses_out = self.channels.get_i64(&self.pv("PulsesOut_RBV")).await?;
        let detector_triggers = self.channels.get_i64(&self.pv("DetTriggers_RBV")).await?;
        Ok(PulseCounters {
            pulses_out: u64::try_from(pulses_out).unwrap_or(0),
            detector_triggers: u64::try_from(detector_triggers).unwrap_or(0),
        })
    }
}

impl Device for TriggerGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn channel_names(&self) -> Vec<String> {
        [
            "Divisor",
            "Width",
            "Delay",
            "PulseCount",
            "Reset",
            "Enable",
            "DetGate",
            "PulsesOut_RBV",
            "DetTriggers_RBV",
        ]
        .iter()
        .map(|s| self.pv(s))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::SimChannelLayer;
    use crate::hardware::mock;

    fn generator(sim: &SimChannelLayer) -> TriggerGenerator {
        let config = TriggerConfig {
            reset_settle_s: 0.01,
            ..TriggerConfig::default()
        };
        TriggerGenerator::new("softglue", "sg:", Arc::new(sim.clone()), &config)
    }

    #[test]
    fn plan_rejects_width_longer_than_period() {
        assert!(TriggerPlan::new(0.02, 0.02, 1e7).is_ok());
        assert!(matches!(
            TriggerPlan::new(0.02, 0.021, 1e7),
            Err(FlyscanError::InvalidTriggerPlan(_))
        ));
        assert!(TriggerPlan::new(0.0, 0.0, 1e7).is_err());
        assert!(TriggerPlan::new(1e-9, 1e-9, 1e7).is_err());
    }

    #[test]
    fn whole_tick_periods_have_no_residue() {
        let regs = TriggerPlan::new(0.02, 0.01, 1e7).unwrap().registers();
        assert_eq!(regs.divisor, 200_000);
        assert_eq!(regs.width, 100_000);
        assert_eq!(regs.period_residue_s(), 0.0);
    }

    #[test]
    fn fractional_ticks_are_floored_and_reported() {
        // 1 / 3 s at 10 MHz is 3_333_333.33 ticks
        let regs = TriggerPlan::new(1.0 / 3.0, 0.1, 1e7).unwrap().registers();
        assert_eq!(regs.divisor, 3_333_333);
        let residue = regs.period_residue_s();
        assert!(residue > 0.0 && residue < 1.0 / 1e7);
    }

    #[tokio::test]
    async fn configure_round_trips_within_one_tick() {
        let sim = SimChannelLayer::new();
        mock::install_trigger(&sim, "sg:", 1e7);
        let trigger = generator(&sim);

        for (period, collection) in [(0.02, 0.01), (0.013_7, 0.013_7), (0.5, 0.000_3), (1.0 / 7.0, 0.1)] {
            let written = trigger.configure(period, collection, 0.0).await.unwrap();
            let read = trigger.verify(&written).await.unwrap();
            let tick = 1.0 / trigger.reference_clock_hz();
            assert!((read.effective_period() - period).abs() < tick);
            assert!((read.effective_width() - collection).abs() < tick);
        }
    }

    #[tokio::test]
    async fn disconnected_register_is_caught_by_verify() {
        let sim = SimChannelLayer::new();
        mock::install_trigger(&sim, "sg:", 1e7);
        let trigger = generator(&sim);
        sim.disconnect("sg:Width");

        // configure itself does not fail
        let written = trigger.configure(0.02, 0.01, 0.0).await.unwrap();
        assert!(trigger.verify(&written).await.is_err());
    }

    #[tokio::test]
    async fn stop_closes_gate_before_subsystem() {
        let sim = SimChannelLayer::new();
        mock::install_trigger(&sim, "sg:", 1e7);
        let trigger = generator(&sim);

        trigger.configure(0.02, 0.01, 0.0).await.unwrap();
        trigger.start().await.unwrap();
        assert_eq!(trigger.gate_states().await.unwrap(), (true, true));
        trigger.stop().await.unwrap();
        assert_eq!(trigger.gate_states().await.unwrap(), (false, false));

        let order: Vec<String> = sim
            .puts()
            .into_iter()
            .filter(|(pv, v)| (pv == "sg:DetGate" || pv == "sg:Enable") && !v.is_on())
            .map(|(pv, _)| pv)
            .collect();
        assert_eq!(order, vec!["sg:DetGate".to_string(), "sg:Enable".to_string()]);
    }

    #[tokio::test]
    async fn reset_pulses_high_then_low() {
        let sim = SimChannelLayer::new();
        mock::install_trigger(&sim, "sg:", 1e7);
        let trigger = generator(&sim);

        trigger.reset().await.unwrap();
        assert_eq!(
            sim.puts_to("sg:Reset"),
            vec![ChannelValue::Int(1), ChannelValue::Int(0)]
        );
        assert_eq!(trigger.counters().await.unwrap(), PulseCounters::default());
    }

    #[tokio::test]
    async fn drain_time_uses_configured_period() {
        let sim = SimChannelLayer::new();
        mock::install_trigger(&sim, "sg:", 1e7);
        let trigger = generator(&sim);

        assert_eq!(trigger.pending_pulse_drain_time(12_500.0), Duration::from_secs_f64(0.1));
        trigger.configure(0.02, 0.01, 0.0).await.unwrap();
        let drain = trigger.pending_pulse_drain_time(10.0);
        assert!((drain.as_secs_f64() - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unbounded_drain_time_is_clamped() {
        let sim = SimChannelLayer::new();
        mock::install_trigger(&sim, "sg:", 1e7);
        let trigger = generator(&sim);
        trigger.configure(0.02, 0.01, 0.0).await.unwrap();

        assert_eq!(trigger.pending_pulse_drain_time(f64::INFINITY), MAX_DRAIN_TIME);
        assert_eq!(trigger.pending_pulse_drain_time(1e300), MAX_DRAIN_TIME);
        assert_eq!(trigger.pending_pulse_drain_time(f64::NAN), Duration::from_secs_f64(0.1));
    }

    #[test]
    fn lease_is_exclusive() {
        let sim = SimChannelLayer::new();
        let trigger = generator(&sim);
        let lease = trigger.try_lease().unwrap();
        assert!(matches!(trigger.try_lease(), Err(FlyscanError::HardwareBusy)));
        drop(lease);
        assert!(trigger.try_lease().is_ok());
    }
}
