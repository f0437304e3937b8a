//! Operator-facing control surface.
//!
//! Range changes go straight to the shared channel specs and never wait for
//! the engine. Lifecycle calls are serialized through the engine lock.

use std::sync::{Mutex, MutexGuard};

use tracing::info;

use crate::{
    backend::HardwareBackend,
    config::{ParkConfig, ScanTiming},
    engine::{StreamMonitor, StreamState, StreamingEngine},
    ChannelSet, Result, ScanError, WaveformSpec,
};

pub struct ScanController<B: HardwareBackend> {
    channels: ChannelSet,
    monitor: StreamMonitor,
    engine: Mutex<StreamingEngine<B>>,
}

impl<B: HardwareBackend> ScanController<B> {
    pub fn new(engine: StreamingEngine<B>) -> Self {
        Self {
            channels: engine.channels().clone(),
            monitor: engine.monitor(),
            engine: Mutex::new(engine),
        }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn monitor(&self) -> &StreamMonitor {
        &self.monitor
    }

    /// Sets the operator range of one channel. Takes effect from the next
    /// refill block while streaming.
    pub fn set_range(&self, channel_id: &str, range_min: f64, range_max: f64) -> Result<()> {
        let spec = self.spec(channel_id)?;
        spec.set_range(range_min, range_max)?;
        info!(
            channel = channel_id,
            label = spec.label(),
            range_min,
            range_max,
            "range updated"
        );
        Ok(())
    }

    pub fn get_range(&self, channel_id: &str) -> Result<(f64, f64)> {
        Ok(self.spec(channel_id)?.range())
    }

    /// Allocates the streams if needed and starts scanning.
    pub fn trigger_start(&self) -> Result<()> {
        let mut engine = self.lock_engine()?;
        if engine.state() == StreamState::Idle {
            engine.configure()?;
        }
        engine.start()
    }

    /// Stops scanning and releases the hardware.
    pub fn trigger_stop(&self) -> Result<()> {
        let mut engine = self.lock_engine()?;
        let stopped = engine.stop();
        let closed = engine.close();
        stopped.and(closed)
    }

    pub fn zero(&self) -> Result<()> {
        self.lock_engine()?.zero()
    }

    pub fn park(&self) -> Result<()> {
        self.lock_engine()?.park()
    }

    pub fn park_at(&self, position: ParkConfig) -> Result<()> {
        self.lock_engine()?.park_at(position)
    }

    pub fn set_voltages(&self, values: &[f64]) -> Result<()> {
        self.lock_engine()?.set_voltages(values)
    }

    pub fn set_scan_timing(&self, timing: ScanTiming) -> Result<()> {
        self.lock_engine()?.set_scan_timing(timing)
    }

    pub fn state(&self) -> StreamState {
        self.monitor.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == StreamState::Running
    }

    /// Clears and returns the fault that halted the last run.
    pub fn take_fault(&self) -> Result<Option<ScanError>> {
        Ok(self.lock_engine()?.take_fault())
    }

    /// Runs `f` with exclusive access to the engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut StreamingEngine<B>) -> R) -> Result<R> {
        let mut engine = self.lock_engine()?;
        Ok(f(&mut engine))
    }

    fn spec(&self, channel_id: &str) -> Result<&WaveformSpec> {
        self.channels
            .get(channel_id)
            .ok_or_else(|| ScanError::precondition(format!("unknown channel `{channel_id}`")))
    }

    fn lock_engine(&self) -> Result<MutexGuard<'_, StreamingEngine<B>>> {
        self.engine
            .lock()
            .map_err(|_| ScanError::device("streaming engine has been poisoned"))
    }
}
