//! Core library for the galvo scan controller.
//!
//! The crate generates periodic analog drive waveforms for a scanning
//! microscope (two galvo mirrors, a piezo objective stage and a camera
//! trigger) and streams them to a DAQ device without gaps, while capturing a
//! hardware-synchronized feedback signal. Each module owns one subsystem:
//! waveform math, the shared timebase, the channel set, the hardware
//! capability, the streaming engine and the operator control surface.

pub mod backend;
pub mod block;
pub mod channel;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod timebase;
pub mod waveform;

pub use backend::{
    DeviceInfo, HardwareBackend, InputBinding, OutputBinding, SimClock, SimEvent,
    SimulatedBackend, StreamCallback, TaskHandle, TriggerSource,
};
pub use block::Block;
pub use channel::ChannelSet;
pub use config::{
    AppConfig, DeviceConfig, InputChannelConfig, OutputChannelConfig, ParkConfig, ScanAxis,
    ScanTiming, StreamConfig, TerminalConfig,
};
pub use control::ScanController;
pub use engine::{AcquisitionSink, StreamMonitor, StreamState, StreamingEngine};
pub use error::{Result, ScanError};
pub use timebase::Timebase;
pub use waveform::{AtomicF64, WaveformKind, WaveformSpec};
