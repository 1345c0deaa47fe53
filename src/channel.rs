//! Control-system channel layer.
//!
//! Every hardware operation in this crate is expressed as "put a value, get a
//! completion status, optionally await a readback" on a named channel (a
//! process variable, or PV). [`ChannelAccess`] is the seam to the real client
//! library; this crate never implements the wire protocol itself.
//!
//! Monitors are `tokio::sync::watch` receivers: a new subscriber immediately
//! sees the current value, and dropping the receiver unsubscribes.
//!
//! [`SimChannelLayer`] is an in-memory implementation used by the simulated
//! IOCs in [`crate::hardware::mock`] and by the tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

use crate::error::{ChannelError, FlyscanError, FlyscanResult};

/// Scalar or string value carried by a channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelValue {
    /// Integer / enum / binary record value
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    Str(String),
}

impl ChannelValue {
    /// Numeric view; strings are parsed
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ChannelValue::Int(v) => Some(*v as f64),
            ChannelValue::Float(v) => Some(*v),
            ChannelValue::Str(s) => s.trim().parse().ok(),
        }
    }

    /// Integer view; floats must be integral
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ChannelValue::Int(v) => Some(*v),
            ChannelValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            ChannelValue::Float(_) => None,
            ChannelValue::Str(s) => s.trim().parse().ok(),
        }
    }

    /// String view (only for string channels)
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ChannelValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// True for a non-zero numeric value
    pub fn is_on(&self) -> bool {
        self.as_f64().map(|v| v != 0.0).unwrap_or(false)
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelValue::Int(v) => write!(f, "{v}"),
            ChannelValue::Float(v) => write!(f, "{v}"),
            ChannelValue::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for ChannelValue {
    fn from(value: i64) -> Self {
        ChannelValue::Int(value)
    }
}

impl From<u64> for ChannelValue {
    fn from(value: u64) -> Self {
        ChannelValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for ChannelValue {
    fn from(value: bool) -> Self {
        ChannelValue::Int(i64::from(value))
    }
}

impl From<f64> for ChannelValue {
    fn from(value: f64) -> Self {
        ChannelValue::Float(value)
    }
}

impl From<&str> for ChannelValue {
    fn from(value: &str) -> Self {
        ChannelValue::Str(value.to_string())
    }
}

impl From<String> for ChannelValue {
    fn from(value: String) -> Self {
        ChannelValue::Str(value)
    }
}

/// Typed get/put/monitor access to named channels.
///
/// # Contract
/// - `put` returns once the server has accepted the value
/// - `monitor` returns a receiver holding the current value; changes are
///   delivered until the receiver is dropped
/// - Operations on a disconnected channel fail with [`ChannelError::Disconnected`]
#[async_trait]
pub trait ChannelAccess: Send + Sync {
    /// Wait for a channel to connect
    async fn connect(&self, pv: &str, timeout: Duration) -> Result<(), ChannelError>;

    /// Read the current value
    async fn get(&self, pv: &str) -> Result<ChannelValue, ChannelError>;

    /// Write a value and wait for the put to complete
    async fn put(&self, pv: &str, value: ChannelValue) -> Result<(), ChannelError>;

    /// Subscribe to value changes
    fn monitor(&self, pv: &str) -> Result<watch::Receiver<ChannelValue>, ChannelError>;

    /// Read a numeric value
    async fn get_f64(&self, pv: &str) -> Result<f64, ChannelError> {
        self.get(pv)
            .await?
            .as_f64()
            .ok_or_else(|| ChannelError::TypeMismatch {
                pv: pv.to_string(),
                expected: "numeric",
            })
    }

    /// Read an integer value
    async fn get_i64(&self, pv: &str) -> Result<i64, ChannelError> {
        self.get(pv)
            .await?
            .as_i64()
            .ok_or_else(|| ChannelError::TypeMismatch {
                pv: pv.to_string(),
                expected: "an integer",
            })
    }

    /// Read a string value
    async fn get_string(&self, pv: &str) -> Result<String, ChannelError> {
        match self.get(pv).await? {
            ChannelValue::Str(s) => Ok(s),
            _ => Err(ChannelError::TypeMismatch {
                pv: pv.to_string(),
                expected: "a string",
            }),
        }
    }
}

/// Wait until `pv` satisfies `predicate`, or fail after `timeout`.
pub async fn wait_for_value<F>(
    layer: &dyn ChannelAccess,
    pv: &str,
    timeout: Duration,
    predicate: F,
) -> FlyscanResult<ChannelValue>
where
    F: Fn(&ChannelValue) -> bool,
{
    let mut rx = layer.monitor(pv)?;
    let result = match tokio::time::timeout(timeout, rx.wait_for(|v| predicate(v))).await {
        Ok(Ok(value)) => Ok(value.clone()),
        Ok(Err(_)) => Err(ChannelError::Disconnected(pv.to_string()).into()),
        Err(_) => Err(FlyscanError::timeout(format!("channel '{pv}'"), timeout)),
    };
    result
}

// =============================================================================
// SimChannelLayer - in-memory channels
// =============================================================================

/// Callback run after a client put, used by simulated IOCs
pub type PutHook = Arc<dyn Fn(&SimChannelLayer, &ChannelValue) + Send + Sync>;

struct SimChannel {
    tx: watch::Sender<ChannelValue>,
    connected: bool,
}

#[derive(Default)]
struct SimInner {
    channels: Mutex<HashMap<String, SimChannel>>,
    hooks: Mutex<HashMap<String, Vec<PutHook>>>,
    put_log: Mutex<Vec<(String, ChannelValue)>>,
}

/// In-memory channel layer.
///
/// Clones share the same channels. Client puts are logged and run any hooks
/// registered with [`SimChannelLayer::on_put`]; IOC-side updates go through
/// [`SimChannelLayer::set`], which neither logs nor runs hooks.
#[derive(Clone, Default)]
pub struct SimChannelLayer {
    inner: Arc<SimInner>,
}

impl SimChannelLayer {
    /// Create an empty channel layer
    pub fn new() -> Self {
        Self::default()
    }

    /// IOC-side write: creates the channel if needed and notifies monitors
    pub fn set(&self, pv: &str, value: impl Into<ChannelValue>) {
        let value = value.into();
        let mut channels = self.inner.channels.lock();
        match channels.get(pv) {
            Some(channel) => {
                channel.tx.send_replace(value);
            }
            None => {
                let (tx, _rx) = watch::channel(value);
                channels.insert(
                    pv.to_string(),
                    SimChannel {
                        tx,
                        connected: true,
                    },
                );
            }
        }
    }

    /// Current value, regardless of connection state
    pub fn value(&self, pv: &str) -> Option<ChannelValue> {
        self.inner
            .channels
            .lock()
            .get(pv)
            .map(|c| c.tx.borrow().clone())
    }

    /// Current value as an integer (0 when missing)
    pub fn value_i64(&self, pv: &str) -> i64 {
        self.value(pv).and_then(|v| v.as_i64()).unwrap_or(0)
    }

    /// Current value as a float (0.0 when missing)
    pub fn value_f64(&self, pv: &str) -> f64 {
        self.value(pv).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    /// Current value as a string (empty when missing)
    pub fn value_string(&self, pv: &str) -> String {
        self.value(pv).map(|v| v.to_string()).unwrap_or_default()
    }

    /// Register a hook run after every client put to `pv`
    pub fn on_put<F>(&self, pv: &str, hook: F)
    where
        F: Fn(&SimChannelLayer, &ChannelValue) + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .lock()
            .entry(pv.to_string())
            .or_default()
            .push(Arc::new(hook));
    }

    /// Simulate a lost connection
    pub fn disconnect(&self, pv: &str) {
        if let Some(channel) = self.inner.channels.lock().get_mut(pv) {
            channel.connected = false;
        }
    }

    /// Restore a lost connection
    pub fn reconnect(&self, pv: &str) {
        if let Some(channel) = self.inner.channels.lock().get_mut(pv) {
            channel.connected = true;
        }
    }

    /// All client puts so far, in order
    pub fn puts(&self) -> Vec<(String, ChannelValue)> {
        self.inner.put_log.lock().clone()
    }

    /// Client puts to a single channel, in order
    pub fn puts_to(&self, pv: &str) -> Vec<ChannelValue> {
        self.inner
            .put_log
            .lock()
            .iter()
            .filter(|(name, _)| name == pv)
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn sender(&self, pv: &str) -> Result<watch::Sender<ChannelValue>, ChannelError> {
        let channels = self.inner.channels.lock();
        match channels.get(pv) {
            Some(c) if c.connected => Ok(c.tx.clone()),
            Some(_) => Err(ChannelError::Disconnected(pv.to_string())),
            None => Err(ChannelError::NotConnected(pv.to_string())),
        }
    }
}

#[async_trait]
impl ChannelAccess for SimChannelLayer {
    async fn connect(&self, pv: &str, timeout: Duration) -> Result<(), ChannelError> {
        // Unknown channels never appear, so fail as the timeout would
        match self.sender(pv) {
            Ok(_) => Ok(()),
            Err(_) => Err(ChannelError::ConnectTimeout {
                pv: pv.to_string(),
                timeout,
            }),
        }
    }

    async fn get(&self, pv: &str) -> Result<ChannelValue, ChannelError> {
        let tx = self.sender(pv)?;
        let value = tx.borrow().clone();
        Ok(value)
    }

    async fn put(&self, pv: &str, value: ChannelValue) -> Result<(), ChannelError> {
        let tx = self.sender(pv)?;
        trace!(pv, %value, "put");
        tx.send_replace(value.clone());
        self.inner.put_log.lock().push((pv.to_string(), value.clone()));

        let hooks = self.inner.hooks.lock().get(pv).cloned().unwrap_or_default();
        for hook in hooks {
            hook(self, &value);
        }
        Ok(())
    }

    fn monitor(&self, pv: &str) -> Result<watch::Receiver<ChannelValue>, ChannelError> {
        Ok(self.sender(pv)?.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn value_conversions() {
        assert_eq!(ChannelValue::from(3_i64).as_f64(), Some(3.0));
        assert_eq!(ChannelValue::from(2.0).as_i64(), Some(2));
        assert_eq!(ChannelValue::from(2.5).as_i64(), None);
        assert_eq!(ChannelValue::from(" 7 ").as_i64(), Some(7));
        assert_eq!(ChannelValue::from("Idle").as_str(), Some("Idle"));
        assert!(ChannelValue::from(true).is_on());
        assert!(!ChannelValue::from(0_i64).is_on());
    }

    #[tokio::test]
    async fn put_runs_hooks_and_logs() {
        let sim = SimChannelLayer::new();
        sim.set("m1.VAL", 0.0);
        sim.set("m1.RBV", 0.0);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        sim.on_put("m1.VAL", move |sim, value| {
            counter.fetch_add(1, Ordering::SeqCst);
            sim.set("m1.RBV", value.clone());
        });

        sim.put("m1.VAL", 4.5.into()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sim.get_f64("m1.RBV").await.unwrap(), 4.5);
        assert_eq!(sim.puts_to("m1.VAL"), vec![ChannelValue::Float(4.5)]);
        // IOC-side writes are not client puts
        assert!(sim.puts_to("m1.RBV").is_empty());
    }

    #[tokio::test]
    async fn disconnected_channels_fail() {
        let sim = SimChannelLayer::new();
        sim.set("sg:enable", 0_i64);
        sim.disconnect("sg:enable");

        assert_eq!(
            sim.put("sg:enable", 1_i64.into()).await,
            Err(ChannelError::Disconnected("sg:enable".into()))
        );
        assert!(sim.monitor("sg:enable").is_err());
        assert!(matches!(
            sim.connect("sg:enable", Duration::from_millis(10)).await,
            Err(ChannelError::ConnectTimeout { .. })
        ));
        assert!(matches!(
            sim.get("nope").await,
            Err(ChannelError::NotConnected(_))
        ));

        sim.reconnect("sg:enable");
        sim.put("sg:enable", 1_i64.into()).await.unwrap();
    }

    #[tokio::test]
    async fn wait_for_value_resolves_and_times_out() {
        let sim = SimChannelLayer::new();
        sim.set("pos:Status", "Idle");

        let writer = sim.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.set("pos:Status", "Acquiring");
        });

        let value = wait_for_value(&sim, "pos:Status", Duration::from_secs(2), |v| {
            v.as_str() == Some("Acquiring")
        })
        .await
        .unwrap();
        assert_eq!(value, ChannelValue::from("Acquiring"));

        let err = wait_for_value(&sim, "pos:Status", Duration::from_millis(20), |v| {
            v.as_str() == Some("Idle")
        })
        .await
        .unwrap_err();
        assert!(matches!(err, FlyscanError::Timeout { .. }));
    }
}
