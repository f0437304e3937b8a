//! Hardware I/O capability consumed by the streaming engine.
//!
//! A backend owns the device driver: channel setup, the sample clock,
//! on-device buffers, start triggers and the threads that deliver refill and
//! acquisition events. The engine only sees the narrow surface below.
//!
//! Contract every implementation must honour:
//! - callbacks run on backend-owned threads, never re-entrantly for the same
//!   task;
//! - a callback returning `Err` halts that task's stream and it is not
//!   invoked again until the task is restarted;
//! - `stop` discards output samples that were queued but not yet played;
//! - `close` drops any registered callbacks and invalidates the handle.

pub mod sim;

use std::{fmt, time::Duration};

use crate::{config::TerminalConfig, Block, Result};

pub use sim::{SimClock, SimEvent, SimulatedBackend};

/// Opaque identifier of a configured hardware task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub u64);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Limits reported by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub product_type: String,
    pub ao_min_rate: f64,
    pub ao_max_rate: f64,
}

/// Analog output line and its voltage limits.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputBinding {
    pub line: String,
    pub min_val: f64,
    pub max_val: f64,
}

/// Analog input line, its voltage limits and terminal configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct InputBinding {
    pub line: String,
    pub min_val: f64,
    pub max_val: f64,
    pub terminal: TerminalConfig,
}

/// Event an input task can be armed to start on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// The start of the output stream on the same device.
    OutputStart,
}

/// Refill or acquisition handler. Receives the number of samples per channel
/// that elapsed since the previous invocation.
pub type StreamCallback = Box<dyn FnMut(usize) -> Result<()> + Send>;

pub trait HardwareBackend: Send + Sync + 'static {
    fn device_info(&self) -> DeviceInfo;

    fn configure_output(&self, channels: &[OutputBinding], sample_rate: f64)
        -> Result<TaskHandle>;

    fn configure_input(&self, channels: &[InputBinding], sample_rate: f64) -> Result<TaskHandle>;

    /// Sizes the on-device buffer, in scalar samples across all channels.
    fn set_buffer_size(&self, handle: TaskHandle, samples: usize) -> Result<()>;

    fn arm_input_trigger(&self, input: TaskHandle, source: TriggerSource) -> Result<()>;

    /// Queues a block for playback, waiting at most `timeout` for room.
    fn write_block(&self, output: TaskHandle, block: &Block, timeout: Duration) -> Result<()>;

    /// Fills `into` with the next captured samples, waiting at most `timeout`.
    fn read_block(&self, input: TaskHandle, into: &mut Block, timeout: Duration) -> Result<()>;

    fn register_refill_callback(
        &self,
        output: TaskHandle,
        period_samples: usize,
        callback: StreamCallback,
    ) -> Result<()>;

    fn register_acquisition_callback(
        &self,
        input: TaskHandle,
        period_samples: usize,
        callback: StreamCallback,
    ) -> Result<()>;

    fn start(&self, handle: TaskHandle) -> Result<()>;

    fn stop(&self, handle: TaskHandle) -> Result<()>;

    fn close(&self, handle: TaskHandle) -> Result<()>;

    /// Writes one sample per channel and returns once the device has
    /// produced it.
    fn write_single(&self, handle: TaskHandle, values: &[f64], timeout: Duration) -> Result<()>;
}
