//! Continuous, double-buffered waveform generation with triggered acquisition.
//!
//! The engine pre-fills the device output buffer with `buffer_oversize`
//! blocks, then keeps it topped up from the backend's refill callback: every
//! time one block has been played, exactly one new block is rendered against
//! the shared [`Timebase`] and queued. The acquisition stream is armed on the
//! output start trigger so both streams share sample zero.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
    },
    time::Duration,
};

use tracing::{debug, error, info, warn};

use crate::{
    backend::{
        HardwareBackend, InputBinding, OutputBinding, StreamCallback, TaskHandle, TriggerSource,
    },
    channel::{check_below_nyquist, check_frequency_ratios},
    config::{AppConfig, ParkConfig, ScanAxis, ScanTiming, StreamConfig},
    Block, ChannelSet, Result, ScanError, Timebase, WaveformSpec,
};

/// Lifecycle of the streaming engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamState {
    /// No hardware resources are held.
    Idle = 0,
    /// Tasks are allocated, the output buffer is pre-filled and callbacks
    /// are registered.
    Configured = 1,
    /// Both streams are started and callbacks are firing.
    Running = 2,
    /// Streams are stopped, or a fatal fault halted them. Allocation is kept.
    Stopped = 3,
}

impl StreamState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StreamState::Configured,
            2 => StreamState::Running,
            3 => StreamState::Stopped,
            _ => StreamState::Idle,
        }
    }
}

/// Consumer of raw acquired blocks, called on the acquisition thread.
pub type AcquisitionSink = Box<dyn FnMut(&Block) + Send>;

/// Task pair of one configured run.
#[derive(Debug, Clone, Copy)]
struct RunTasks {
    output: TaskHandle,
    input: Option<TaskHandle>,
}

impl RunTasks {
    /// Input first, matching the stop order of `StreamingEngine::stop`.
    fn handles(self) -> impl Iterator<Item = TaskHandle> {
        [self.input, Some(self.output)].into_iter().flatten()
    }
}

/// State shared between the engine and the callbacks it hands the backend.
struct StreamShared {
    channels: ChannelSet,
    timebase: Mutex<Timebase>,
    state: AtomicU8,
    /// Callbacks hold a read guard while they run; `stop` takes the write
    /// side to wait for them.
    in_flight: RwLock<()>,
    refills: AtomicU64,
    acquisitions: AtomicU64,
    fault: Mutex<Option<ScanError>>,
    sink: Mutex<Option<AcquisitionSink>>,
}

impl StreamShared {
    fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn lock_timebase(&self) -> Result<MutexGuard<'_, Timebase>> {
        self.timebase
            .lock()
            .map_err(|_| ScanError::device("timebase has been poisoned"))
    }

    /// Advances the timebase once and renders every channel against the
    /// same timestamps.
    fn render_next(&self, times: &mut [f64], block: &mut Block) -> Result<()> {
        let mut timebase = self.lock_timebase()?;
        timebase.fill_next_block(times);
        self.channels.render_into(times, block);
        Ok(())
    }

    fn reset_run(&self) -> Result<()> {
        self.lock_timebase()?.reset();
        self.refills.store(0, Ordering::Relaxed);
        self.acquisitions.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn wait_for_callbacks(&self) {
        drop(self.in_flight.write().unwrap_or_else(PoisonError::into_inner));
    }

    /// Records a fatal fault raised on a callback thread and leaves the
    /// running state. Only the first fault of a run is kept. Returns whether
    /// this call ended the run.
    fn fail(&self, operation: &'static str, err: &ScanError) -> bool {
        let halted = self
            .state
            .compare_exchange(
                StreamState::Running as u8,
                StreamState::Stopped as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if halted {
            error!(operation, error = %err, "stream halted by fatal fault");
        }
        let mut fault = self.fault.lock().unwrap_or_else(PoisonError::into_inner);
        if fault.is_none() {
            *fault = Some(err.clone());
        }
        halted
    }

    /// Fatal fault path of the callbacks: both streams are stopped on the
    /// device and the timebase is rewound, leaving the same state as `stop`.
    fn halt<B: HardwareBackend>(
        &self,
        backend: &B,
        tasks: RunTasks,
        operation: &'static str,
        err: &ScanError,
    ) {
        if !self.fail(operation, err) {
            return;
        }
        for handle in tasks.handles() {
            if let Err(stop) = backend.stop(handle) {
                warn!(task = %handle, error = %stop, "failed to stop stream after fault");
            }
        }
        if let Err(reset) = self.reset_run() {
            warn!(error = %reset, "failed to rewind timebase after fault");
        }
    }

    fn retime(&self, frequencies: &[f64]) -> Result<()> {
        check_frequency_ratios(frequencies)?;
        let slowest = frequencies.iter().copied().fold(f64::INFINITY, f64::min);
        let mut timebase = self.lock_timebase()?;
        check_below_nyquist(frequencies, timebase.sample_rate())?;
        let retimed = Timebase::new(timebase.sample_rate(), 1.0 / slowest)?;
        self.channels.store_frequencies(frequencies)?;
        *timebase = retimed;
        Ok(())
    }
}

/// Read-only view of a running engine that does not need the engine itself.
#[derive(Clone)]
pub struct StreamMonitor {
    shared: Arc<StreamShared>,
}

impl StreamMonitor {
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Blocks written by the refill callback since the run started.
    pub fn refill_count(&self) -> u64 {
        self.shared.refills.load(Ordering::Relaxed)
    }

    /// Blocks read by the acquisition callback since the run started.
    pub fn acquisition_count(&self) -> u64 {
        self.shared.acquisitions.load(Ordering::Relaxed)
    }

    /// Fault that halted the current run, if any.
    pub fn fault(&self) -> Option<ScanError> {
        self.shared
            .fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl fmt::Debug for StreamMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMonitor")
            .field("state", &self.state())
            .field("refills", &self.refill_count())
            .field("acquisitions", &self.acquisition_count())
            .finish()
    }
}

/// Owns the output and input streams of one device.
pub struct StreamingEngine<B: HardwareBackend> {
    backend: Arc<B>,
    stream: StreamConfig,
    park: ParkConfig,
    outputs: Vec<OutputBinding>,
    axes: Vec<ScanAxis>,
    inputs: Vec<InputBinding>,
    shared: Arc<StreamShared>,
    output: Option<TaskHandle>,
    input: Option<TaskHandle>,
}

impl<B: HardwareBackend> StreamingEngine<B> {
    /// Validates the configuration against the device and builds the
    /// channel set. Nothing is allocated on the device yet.
    pub fn new(backend: Arc<B>, config: &AppConfig) -> Result<Self> {
        config.validate()?;

        let device = backend.device_info();
        let sample_rate = config.stream.sample_rate;
        if !(device.ao_min_rate..=device.ao_max_rate).contains(&sample_rate) {
            warn!(
                sample_rate,
                min = device.ao_min_rate,
                max = device.ao_max_rate,
                "sample rate rejected"
            );
            return Err(ScanError::configuration(format!(
                "sample rate {sample_rate} Hz outside device range [{}, {}]",
                device.ao_min_rate, device.ao_max_rate
            )));
        }

        let specs = config
            .outputs
            .iter()
            .zip(config.frequencies())
            .map(|(output, frequency)| {
                let mut spec = WaveformSpec::new(
                    output.channel_id.clone(),
                    output.min_val,
                    output.max_val,
                    output.waveform,
                    frequency,
                )?;
                if !output.label.is_empty() {
                    spec = spec.with_label(output.label.clone());
                }
                match output.range {
                    Some((range_min, range_max)) => spec.with_range(range_min, range_max),
                    None => Ok(spec),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        let channels = ChannelSet::new(specs)?;
        let timebase = Timebase::new(sample_rate, channels.wrap_period())?;

        let outputs = config
            .outputs
            .iter()
            .map(|output| OutputBinding {
                line: config.device.line(&output.channel_id),
                min_val: output.min_val,
                max_val: output.max_val,
            })
            .collect();
        let inputs = config
            .inputs
            .iter()
            .map(|input| InputBinding {
                line: config.device.line(&input.channel_id),
                min_val: input.min_val,
                max_val: input.max_val,
                terminal: input.terminal,
            })
            .collect();

        info!(
            device = %device.product_type,
            sample_rate,
            samples_per_refresh = config.stream.samples_per_refresh(),
            outputs = channels.len(),
            inputs = config.inputs.len(),
            "streaming engine created"
        );

        Ok(Self {
            backend,
            stream: config.stream.clone(),
            park: config.park,
            outputs,
            axes: config.outputs.iter().map(|output| output.axis).collect(),
            inputs,
            shared: Arc::new(StreamShared {
                channels,
                timebase: Mutex::new(timebase),
                state: AtomicU8::new(StreamState::Idle as u8),
                in_flight: RwLock::new(()),
                refills: AtomicU64::new(0),
                acquisitions: AtomicU64::new(0),
                fault: Mutex::new(None),
                sink: Mutex::new(None),
            }),
            output: None,
            input: None,
        })
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn monitor(&self) -> StreamMonitor {
        StreamMonitor {
            shared: self.shared.clone(),
        }
    }

    /// Shared view of the output channels; ranges set through it apply to
    /// the next generated block.
    pub fn channels(&self) -> &ChannelSet {
        &self.shared.channels
    }

    pub fn samples_per_refresh(&self) -> usize {
        self.stream.samples_per_refresh()
    }

    pub fn output_handle(&self) -> Option<TaskHandle> {
        self.output
    }

    pub fn input_handle(&self) -> Option<TaskHandle> {
        self.input
    }

    /// Time of the first sample of the next block to be generated.
    pub fn cursor(&self) -> Result<f64> {
        Ok(self.shared.lock_timebase()?.cursor())
    }

    pub fn wrap_period(&self) -> Result<f64> {
        Ok(self.shared.lock_timebase()?.wrap_period())
    }

    /// Clears and returns the fault that halted the last run.
    pub fn take_fault(&self) -> Option<ScanError> {
        self.shared
            .fault
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn set_acquisition_sink(&self, sink: AcquisitionSink) {
        *self.shared.sink.lock().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    /// Allocates both streams, pre-fills the output buffer and registers
    /// the refill and acquisition callbacks.
    pub fn configure(&mut self) -> Result<()> {
        let state = self.state();
        if state != StreamState::Idle {
            return Err(self.reject("configure", state));
        }

        if let Err(err) = self.allocate() {
            warn!(error = %err, "configure failed, releasing partial allocation");
            if let Err(release) = self.release() {
                warn!(error = %release, "release after failed configure also failed");
            }
            return Err(err);
        }

        self.shared.set_state(StreamState::Configured);
        info!(
            output = ?self.output,
            input = ?self.input,
            prefilled_blocks = self.stream.buffer_oversize,
            "streams configured"
        );
        Ok(())
    }

    /// Starts acquisition armed on the output start trigger, then starts
    /// generation.
    pub fn start(&mut self) -> Result<()> {
        let state = self.state();
        match state {
            StreamState::Configured => {}
            StreamState::Stopped => self.rearm()?,
            StreamState::Idle | StreamState::Running => return Err(self.reject("start", state)),
        }
        let output = self
            .output
            .ok_or_else(|| ScanError::precondition("no output task is configured"))?;
        self.take_fault();

        if let Some(input) = self.input {
            self.backend
                .arm_input_trigger(input, TriggerSource::OutputStart)?;
            self.backend.start(input)?;
        }

        self.shared.set_state(StreamState::Running);
        if let Err(err) = self.backend.start(output) {
            self.shared.set_state(StreamState::Stopped);
            if let Some(input) = self.input {
                if let Err(stop) = self.backend.stop(input) {
                    warn!(error = %stop, "failed to stop input after output start failure");
                }
            }
            return Err(err);
        }

        let cursor = self.cursor()?;
        info!(cursor, "streaming started");
        Ok(())
    }

    /// Stops both streams, waits for in-flight callbacks and rewinds the
    /// timebase so the next start begins at phase zero.
    pub fn stop(&mut self) -> Result<()> {
        match self.state() {
            StreamState::Running | StreamState::Stopped => {}
            StreamState::Idle | StreamState::Configured => return Ok(()),
        }

        self.shared.set_state(StreamState::Stopped);
        self.shared.wait_for_callbacks();

        let mut first_error = None;
        for handle in [self.input, self.output].into_iter().flatten() {
            if let Err(err) = self.backend.stop(handle) {
                first_error.get_or_insert(err);
            }
        }

        let monitor = self.monitor();
        info!(
            refills = monitor.refill_count(),
            acquisitions = monitor.acquisition_count(),
            "streaming stopped"
        );
        self.shared.reset_run()?;
        first_error.map_or(Ok(()), Err)
    }

    /// Releases every hardware resource. A no-op when already idle.
    pub fn close(&mut self) -> Result<()> {
        let stopped = match self.state() {
            StreamState::Idle => return Ok(()),
            StreamState::Running => self.stop(),
            StreamState::Configured | StreamState::Stopped => Ok(()),
        };

        self.shared.set_state(StreamState::Idle);
        self.shared.wait_for_callbacks();
        let released = self.release();
        self.shared.reset_run()?;
        info!("streams closed");
        stopped.and(released)
    }

    /// Writes one constant value per output channel through a transient
    /// task. Not allowed while streaming.
    pub fn set_voltages(&self, values: &[f64]) -> Result<()> {
        let state = self.state();
        if state == StreamState::Running {
            return Err(self.reject("set_voltages", state));
        }
        if values.len() != self.outputs.len() {
            return Err(ScanError::precondition(format!(
                "expected {} voltages, got {}",
                self.outputs.len(),
                values.len()
            )));
        }
        if let Some((binding, value)) = self
            .outputs
            .iter()
            .zip(values)
            .find(|(binding, value)| !(binding.min_val..=binding.max_val).contains(*value))
        {
            return Err(ScanError::precondition(format!(
                "{value} V outside limits [{}, {}] of {}",
                binding.min_val, binding.max_val, binding.line
            )));
        }

        let handle = self
            .backend
            .configure_output(&self.outputs, self.stream.sample_rate)?;
        let written = self
            .backend
            .write_single(handle, values, self.stream.single_write_timeout());
        let closed = self.backend.close(handle);
        written.and(closed)?;

        info!(?values, "static voltages written");
        Ok(())
    }

    pub fn zero(&self) -> Result<()> {
        self.set_voltages(&vec![0.0; self.outputs.len()])
    }

    /// Moves the galvos and the piezo to the configured park position.
    pub fn park(&self) -> Result<()> {
        self.park_at(self.park)
    }

    /// Drives the first three outputs (x galvo, z galvo, piezo) to `position`
    /// and holds every other output at its resting level.
    pub fn park_at(&self, position: ParkConfig) -> Result<()> {
        let ParkConfig { x, z, piezo } = position;
        let values: Vec<f64> = self
            .outputs
            .iter()
            .enumerate()
            .map(|(index, binding)| match index {
                0 => x,
                1 => z,
                2 => piezo,
                _ => 0.0_f64.clamp(binding.min_val, binding.max_val),
            })
            .collect();
        self.set_voltages(&values)
    }

    /// Replaces every channel frequency at once and restarts the timebase
    /// at zero with the new wrap period.
    pub fn set_frequencies(&self, frequencies: &[f64]) -> Result<()> {
        self.shared.retime(frequencies)?;
        info!(?frequencies, "channel frequencies updated");
        Ok(())
    }

    /// Recomputes channel frequencies from new scan parameters.
    pub fn set_scan_timing(&mut self, timing: ScanTiming) -> Result<()> {
        if timing.frames_per_buffer == 0 || timing.buffers_per_volume == 0 {
            return Err(ScanError::precondition("scan timing values must be non-zero"));
        }
        let frequencies: Vec<f64> = self
            .axes
            .iter()
            .map(|axis| timing.frequency(*axis, self.stream.refreshes_per_sec))
            .collect();
        self.set_frequencies(&frequencies)
    }

    fn allocate(&mut self) -> Result<()> {
        let samples = self.stream.samples_per_refresh();
        let oversize = self.stream.buffer_oversize;
        let sample_rate = self.stream.sample_rate;

        let output = self.backend.configure_output(&self.outputs, sample_rate)?;
        self.output = Some(output);
        self.backend
            .set_buffer_size(output, samples * self.outputs.len() * oversize)?;

        if !self.inputs.is_empty() {
            let input = self.backend.configure_input(&self.inputs, sample_rate)?;
            self.input = Some(input);
            self.backend
                .set_buffer_size(input, samples * self.inputs.len() * oversize)?;
        }

        self.shared.reset_run()?;
        self.prefill(output)?;

        let tasks = RunTasks {
            output,
            input: self.input,
        };
        self.backend.register_refill_callback(
            output,
            samples,
            refill_callback(
                self.backend.clone(),
                self.shared.clone(),
                tasks,
                samples,
                self.stream.write_timeout(),
            ),
        )?;
        if let Some(input) = self.input {
            self.backend.register_acquisition_callback(
                input,
                samples,
                acquisition_callback(
                    self.backend.clone(),
                    self.shared.clone(),
                    tasks,
                    input,
                    self.inputs.len(),
                    samples,
                    self.stream.read_timeout(),
                ),
            )?;
        }
        Ok(())
    }

    fn prefill(&self, output: TaskHandle) -> Result<()> {
        let samples = self.stream.samples_per_refresh();
        let mut times = vec![0.0; samples];
        let mut block = Block::new(self.outputs.len(), samples);
        for _ in 0..self.stream.buffer_oversize {
            self.shared.render_next(&mut times, &mut block)?;
            self.backend
                .write_block(output, &block, self.stream.write_timeout())?;
        }
        debug!(blocks = self.stream.buffer_oversize, "output buffer pre-filled");
        Ok(())
    }

    /// Brings a stopped run back to the configured state: streams stopped,
    /// timebase at zero and the output buffer pre-filled again.
    fn rearm(&mut self) -> Result<()> {
        let output = self
            .output
            .ok_or_else(|| ScanError::precondition("no output task is configured"))?;
        self.shared.wait_for_callbacks();
        for handle in [self.input, Some(output)].into_iter().flatten() {
            self.backend.stop(handle)?;
        }
        self.shared.reset_run()?;
        self.prefill(output)
    }

    fn release(&mut self) -> Result<()> {
        let mut first_error = None;
        for handle in [self.input.take(), self.output.take()].into_iter().flatten() {
            if let Err(err) = self.backend.close(handle) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn reject(&self, operation: &str, state: StreamState) -> ScanError {
        warn!(operation, ?state, "operation rejected");
        ScanError::precondition(format!("cannot {operation} while {state:?}"))
    }
}

impl<B: HardwareBackend> Drop for StreamingEngine<B> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close streams on drop");
        }
    }
}

impl<B: HardwareBackend> fmt::Debug for StreamingEngine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingEngine")
            .field("state", &self.state())
            .field("sample_rate", &self.stream.sample_rate)
            .field("samples_per_refresh", &self.samples_per_refresh())
            .field("outputs", &self.outputs.len())
            .field("inputs", &self.inputs.len())
            .field("output", &self.output)
            .field("input", &self.input)
            .finish()
    }
}

fn refill_callback<B: HardwareBackend>(
    backend: Arc<B>,
    shared: Arc<StreamShared>,
    tasks: RunTasks,
    samples: usize,
    timeout: Duration,
) -> StreamCallback {
    let mut times = vec![0.0; samples];
    let mut block = Block::new(shared.channels.len(), samples);
    Box::new(move |_elapsed| {
        let _in_flight = shared
            .in_flight
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if shared.state() != StreamState::Running {
            return Ok(());
        }

        let written = shared
            .render_next(&mut times, &mut block)
            .and_then(|()| backend.write_block(tasks.output, &block, timeout));
        match written {
            Ok(()) => {
                shared.refills.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                shared.halt(backend.as_ref(), tasks, "refill", &err);
                Err(err)
            }
        }
    })
}

fn acquisition_callback<B: HardwareBackend>(
    backend: Arc<B>,
    shared: Arc<StreamShared>,
    tasks: RunTasks,
    input: TaskHandle,
    channels: usize,
    samples: usize,
    timeout: Duration,
) -> StreamCallback {
    let mut buffer = Block::new(channels, samples);
    Box::new(move |_elapsed| {
        let _in_flight = shared
            .in_flight
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if shared.state() != StreamState::Running {
            return Ok(());
        }

        if let Err(err) = backend.read_block(input, &mut buffer, timeout) {
            shared.halt(backend.as_ref(), tasks, "acquisition", &err);
            return Err(err);
        }
        shared.acquisitions.fetch_add(1, Ordering::Relaxed);
        if let Some(sink) = shared
            .sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            sink(&buffer);
        }
        Ok(())
    })
}
