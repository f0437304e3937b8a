//! In-process model of a multifunction DAQ device.
//!
//! Time only moves when [`SimulatedBackend::advance`] is called, either
//! directly by tests or at the real sample cadence by a [`SimClock`]. Each
//! advance plays samples out of every running output queue, captures the
//! same number of samples on every running (and triggered) input, and then
//! fires the refill and acquisition callbacks that came due.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::{
    DeviceInfo, HardwareBackend, InputBinding, OutputBinding, StreamCallback, TaskHandle,
    TriggerSource,
};
use crate::{Block, Result, ScanError};

/// Observable device activity, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Configured(TaskHandle),
    Armed(TaskHandle, TriggerSource),
    Started(TaskHandle),
    /// An armed input saw its start trigger.
    Triggered(TaskHandle),
    /// The start trigger fired before the input was running.
    MissedTrigger(TaskHandle),
    Stopped(TaskHandle),
    Closed(TaskHandle),
    /// A callback returned an error and the stream was halted.
    Halted(TaskHandle),
    Underrun(TaskHandle),
    Overrun(TaskHandle),
    SingleWrite(TaskHandle, Vec<f64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Output,
    Input,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerState {
    Waiting,
    Fired,
    Missed,
}

struct Registration {
    period: usize,
    elapsed: usize,
    handler: Option<StreamCallback>,
}

impl Registration {
    fn elapse(&mut self, samples: usize) -> usize {
        self.elapsed += samples;
        let due = self.elapsed / self.period;
        self.elapsed %= self.period;
        due
    }
}

struct SimTask {
    direction: Direction,
    channels: usize,
    capacity: Option<usize>,
    /// Interleaved frames, one value per channel per sample.
    queue: VecDeque<f64>,
    trigger: Option<TriggerSource>,
    trigger_state: TriggerState,
    running: bool,
    callback: Option<Registration>,
    trace: Vec<Vec<f64>>,
}

impl SimTask {
    fn new(direction: Direction, channels: usize) -> Self {
        Self {
            direction,
            channels,
            capacity: None,
            queue: VecDeque::new(),
            trigger: None,
            trigger_state: TriggerState::Waiting,
            running: false,
            callback: None,
            trace: vec![Vec::new(); channels],
        }
    }

    fn is_acquiring(&self) -> bool {
        self.running && (self.trigger.is_none() || self.trigger_state == TriggerState::Fired)
    }

    fn due_callbacks(&mut self, samples: usize) -> usize {
        self.callback
            .as_mut()
            .map(|registration| registration.elapse(samples))
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    tasks: HashMap<TaskHandle, SimTask>,
    closed_traces: HashMap<TaskHandle, Vec<Vec<f64>>>,
    events: Vec<SimEvent>,
    stalled: bool,
    device_faults: HashMap<TaskHandle, String>,
}

/// Simulated device implementing [`HardwareBackend`].
pub struct SimulatedBackend {
    info: DeviceInfo,
    feedback_channel: usize,
    record_traces: bool,
    state: Mutex<SimState>,
    changed: Condvar,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::with_device_info(DeviceInfo {
            product_type: "PCIe-6363 (simulated)".to_string(),
            ao_min_rate: 0.0,
            ao_max_rate: 1_000_000.0,
        })
    }

    pub fn with_device_info(info: DeviceInfo) -> Self {
        Self {
            info,
            feedback_channel: 2,
            record_traces: true,
            state: Mutex::new(SimState::default()),
            changed: Condvar::new(),
        }
    }

    /// Output channel looped back into input channel 0. Defaults to the
    /// third output, the piezo drive.
    pub fn with_feedback_channel(mut self, channel: usize) -> Self {
        self.feedback_channel = channel;
        self
    }

    /// Stops recording played and captured samples, for long runs.
    pub fn without_traces(mut self) -> Self {
        self.record_traces = false;
        self
    }

    /// Moves device time forward by `n_samples` sample clock ticks and fires
    /// any callbacks that came due.
    pub fn advance(&self, n_samples: usize) {
        let due = {
            let mut guard = self.state();
            let SimState { tasks, events, .. } = &mut *guard;
            let mut due = Vec::new();
            let mut feedback: Option<Vec<f64>> = None;

            for (&handle, task) in tasks
                .iter_mut()
                .filter(|(_, task)| task.direction == Direction::Output && task.running)
            {
                let available = task.queue.len() / task.channels;
                if available < n_samples {
                    events.push(SimEvent::Underrun(handle));
                }
                let mut looped = Vec::with_capacity(n_samples);
                for _ in 0..n_samples.min(available) {
                    for channel in 0..task.channels {
                        let value = task.queue.pop_front().unwrap_or_default();
                        if self.record_traces {
                            task.trace[channel].push(value);
                        }
                        if channel == self.feedback_channel {
                            looped.push(value);
                        }
                    }
                }
                // An underrun holds the last generated value.
                let hold = looped.last().copied().unwrap_or_default();
                looped.resize(n_samples, hold);
                feedback = Some(looped);

                let count = task.due_callbacks(n_samples);
                if count > 0 {
                    due.push((handle, count));
                }
            }

            for (&handle, task) in tasks
                .iter_mut()
                .filter(|(_, task)| task.direction == Direction::Input && task.is_acquiring())
            {
                for sample in 0..n_samples {
                    for channel in 0..task.channels {
                        let value = match (&feedback, channel) {
                            (Some(looped), 0) => looped[sample],
                            _ => 0.0,
                        };
                        task.queue.push_back(value);
                        if self.record_traces {
                            task.trace[channel].push(value);
                        }
                    }
                }
                if let Some(capacity) = task.capacity {
                    if task.queue.len() > capacity {
                        let excess = task.queue.len() - capacity;
                        task.queue.drain(..excess);
                        events.push(SimEvent::Overrun(handle));
                    }
                }

                let count = task.due_callbacks(n_samples);
                if count > 0 {
                    due.push((handle, count));
                }
            }

            due
        };
        self.changed.notify_all();

        for (handle, count) in due {
            for _ in 0..count {
                if !self.invoke(handle) {
                    break;
                }
            }
        }
    }

    /// While stalled, writes never find room and time out.
    pub fn set_stalled(&self, stalled: bool) {
        self.state().stalled = stalled;
        self.changed.notify_all();
    }

    /// Makes the next block write or read on `handle` fail with a device
    /// error.
    pub fn inject_device_fault(&self, handle: TaskHandle, message: impl Into<String>) {
        self.state().device_faults.insert(handle, message.into());
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state().events.clone()
    }

    /// Samples played (outputs) or captured (inputs) by a task, one row per
    /// channel. Still available after the task is closed.
    pub fn trace(&self, handle: TaskHandle) -> Option<Vec<Vec<f64>>> {
        let state = self.state();
        state
            .tasks
            .get(&handle)
            .map(|task| task.trace.clone())
            .or_else(|| state.closed_traces.get(&handle).cloned())
    }

    pub fn single_writes(&self) -> Vec<Vec<f64>> {
        self.state()
            .events
            .iter()
            .filter_map(|event| match event {
                SimEvent::SingleWrite(_, values) => Some(values.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn open_tasks(&self) -> usize {
        self.state().tasks.len()
    }

    /// Frames waiting in a task's device buffer.
    pub fn queued_frames(&self, handle: TaskHandle) -> Option<usize> {
        self.state()
            .tasks
            .get(&handle)
            .map(|task| task.queue.len() / task.channels)
    }

    fn invoke(&self, handle: TaskHandle) -> bool {
        let (mut handler, period) = {
            let mut state = self.state();
            let Some(task) = state.tasks.get_mut(&handle) else {
                return false;
            };
            if !task.running {
                return false;
            }
            let Some(registration) = task.callback.as_mut() else {
                return false;
            };
            let Some(handler) = registration.handler.take() else {
                return false;
            };
            (handler, registration.period)
        };

        let result = handler(period);

        let mut state = self.state();
        let halted = result.is_err();
        if let Some(task) = state.tasks.get_mut(&handle) {
            if let Some(registration) = task.callback.as_mut() {
                registration.handler = Some(handler);
            }
            if halted {
                task.running = false;
            }
        }
        if halted {
            state.events.push(SimEvent::Halted(handle));
        }
        !halted
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> Result<MutexGuard<'_, SimState>> {
        self.state
            .lock()
            .map_err(|_| ScanError::device("simulated device state has been poisoned"))
    }

    fn configure(&self, direction: Direction, channels: usize, sample_rate: f64) -> Result<TaskHandle> {
        if channels == 0 {
            return Err(ScanError::device("a task needs at least one channel"));
        }
        if !(self.info.ao_min_rate..=self.info.ao_max_rate).contains(&sample_rate) {
            return Err(ScanError::device(format!(
                "sample rate {sample_rate} outside [{}, {}]",
                self.info.ao_min_rate, self.info.ao_max_rate
            )));
        }
        let mut state = self.lock()?;
        state.next_handle += 1;
        let handle = TaskHandle(state.next_handle);
        state.tasks.insert(handle, SimTask::new(direction, channels));
        state.events.push(SimEvent::Configured(handle));
        Ok(handle)
    }

    fn register(
        &self,
        handle: TaskHandle,
        direction: Direction,
        period_samples: usize,
        callback: StreamCallback,
    ) -> Result<()> {
        if period_samples == 0 {
            return Err(ScanError::device("callback period must be non-zero"));
        }
        let mut state = self.lock()?;
        let task = task_mut(&mut state, handle, direction)?;
        task.callback = Some(Registration {
            period: period_samples,
            elapsed: 0,
            handler: Some(callback),
        });
        Ok(())
    }
}

impl HardwareBackend for SimulatedBackend {
    fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn configure_output(&self, channels: &[OutputBinding], sample_rate: f64) -> Result<TaskHandle> {
        self.configure(Direction::Output, channels.len(), sample_rate)
    }

    fn configure_input(&self, channels: &[InputBinding], sample_rate: f64) -> Result<TaskHandle> {
        self.configure(Direction::Input, channels.len(), sample_rate)
    }

    fn set_buffer_size(&self, handle: TaskHandle, samples: usize) -> Result<()> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get_mut(&handle)
            .ok_or_else(|| unknown_task(handle))?;
        task.capacity = Some(samples);
        Ok(())
    }

    fn arm_input_trigger(&self, input: TaskHandle, source: TriggerSource) -> Result<()> {
        let mut state = self.lock()?;
        let task = task_mut(&mut state, input, Direction::Input)?;
        task.trigger = Some(source);
        task.trigger_state = TriggerState::Waiting;
        state.events.push(SimEvent::Armed(input, source));
        Ok(())
    }

    fn write_block(&self, output: TaskHandle, block: &Block, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if let Some(message) = state.device_faults.remove(&output) {
                return Err(ScanError::Device(message));
            }
            let stalled = state.stalled;
            let task = task_mut(&mut state, output, Direction::Output)?;
            if block.channels() != task.channels {
                return Err(ScanError::device(format!(
                    "{output} has {} channels, block has {}",
                    task.channels,
                    block.channels()
                )));
            }
            let room = match task.capacity {
                Some(capacity) if block.len() > capacity => {
                    return Err(ScanError::device(format!(
                        "block of {} samples exceeds buffer of {capacity}",
                        block.len()
                    )));
                }
                Some(capacity) => capacity - task.queue.len().min(capacity) >= block.len(),
                None => true,
            };
            if room && !stalled {
                for sample in 0..block.samples() {
                    for channel in 0..block.channels() {
                        task.queue.push_back(block.get(channel, sample));
                    }
                }
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ScanError::DeadlineExceeded {
                    operation: "write_block",
                    timeout,
                });
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map_err(|_| ScanError::device("simulated device state has been poisoned"))?
                .0;
        }
    }

    fn read_block(&self, input: TaskHandle, into: &mut Block, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        loop {
            if let Some(message) = state.device_faults.remove(&input) {
                return Err(ScanError::Device(message));
            }
            let task = task_mut(&mut state, input, Direction::Input)?;
            if into.channels() != task.channels {
                return Err(ScanError::device(format!(
                    "{input} has {} channels, buffer has {}",
                    task.channels,
                    into.channels()
                )));
            }
            if task.queue.len() >= into.len() {
                for sample in 0..into.samples() {
                    for channel in 0..into.channels() {
                        let value = task.queue.pop_front().unwrap_or_default();
                        into.set(channel, sample, value);
                    }
                }
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ScanError::DeadlineExceeded {
                    operation: "read_block",
                    timeout,
                });
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .map_err(|_| ScanError::device("simulated device state has been poisoned"))?
                .0;
        }
    }

    fn register_refill_callback(
        &self,
        output: TaskHandle,
        period_samples: usize,
        callback: StreamCallback,
    ) -> Result<()> {
        self.register(output, Direction::Output, period_samples, callback)
    }

    fn register_acquisition_callback(
        &self,
        input: TaskHandle,
        period_samples: usize,
        callback: StreamCallback,
    ) -> Result<()> {
        self.register(input, Direction::Input, period_samples, callback)
    }

    fn start(&self, handle: TaskHandle) -> Result<()> {
        let mut guard = self.lock()?;
        let SimState { tasks, events, .. } = &mut *guard;
        let task = tasks.get_mut(&handle).ok_or_else(|| unknown_task(handle))?;
        task.running = true;
        let direction = task.direction;
        events.push(SimEvent::Started(handle));

        if direction == Direction::Output {
            for (&input, task) in tasks.iter_mut().filter(|(_, task)| {
                task.trigger == Some(TriggerSource::OutputStart)
                    && task.trigger_state == TriggerState::Waiting
            }) {
                if task.running {
                    task.trigger_state = TriggerState::Fired;
                    events.push(SimEvent::Triggered(input));
                } else {
                    task.trigger_state = TriggerState::Missed;
                    events.push(SimEvent::MissedTrigger(input));
                }
            }
        }
        Ok(())
    }

    fn stop(&self, handle: TaskHandle) -> Result<()> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .get_mut(&handle)
            .ok_or_else(|| unknown_task(handle))?;
        task.running = false;
        task.queue.clear();
        task.trigger_state = TriggerState::Waiting;
        if let Some(registration) = task.callback.as_mut() {
            registration.elapsed = 0;
        }
        state.events.push(SimEvent::Stopped(handle));
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn close(&self, handle: TaskHandle) -> Result<()> {
        let mut state = self.lock()?;
        let task = state
            .tasks
            .remove(&handle)
            .ok_or_else(|| unknown_task(handle))?;
        state.closed_traces.insert(handle, task.trace);
        state.events.push(SimEvent::Closed(handle));
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn write_single(&self, handle: TaskHandle, values: &[f64], timeout: Duration) -> Result<()> {
        let mut guard = self.lock()?;
        if guard.stalled {
            return Err(ScanError::DeadlineExceeded {
                operation: "write_single",
                timeout,
            });
        }
        let SimState { tasks, events, .. } = &mut *guard;
        let task = tasks.get_mut(&handle).ok_or_else(|| unknown_task(handle))?;
        if task.direction != Direction::Output || values.len() != task.channels {
            return Err(ScanError::device(format!(
                "{handle} cannot take {} values",
                values.len()
            )));
        }
        if self.record_traces {
            for (row, &value) in task.trace.iter_mut().zip(values) {
                row.push(value);
            }
        }
        events.push(SimEvent::SingleWrite(handle, values.to_vec()));
        Ok(())
    }
}

impl fmt::Debug for SimulatedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("SimulatedBackend")
            .field("info", &self.info)
            .field("feedback_channel", &self.feedback_channel)
            .field("tasks", &state.tasks.len())
            .field("events", &state.events.len())
            .finish()
    }
}

fn unknown_task(handle: TaskHandle) -> ScanError {
    ScanError::device(format!("unknown {handle}"))
}

fn task_mut(state: &mut SimState, handle: TaskHandle, direction: Direction) -> Result<&mut SimTask> {
    let task = state
        .tasks
        .get_mut(&handle)
        .ok_or_else(|| unknown_task(handle))?;
    if task.direction != direction {
        return Err(ScanError::device(format!(
            "{handle} is not an {} task",
            match direction {
                Direction::Output => "output",
                Direction::Input => "input",
            }
        )));
    }
    Ok(task)
}

/// Thread that advances a [`SimulatedBackend`] at the real sample cadence.
/// Dropping the clock stops and joins the thread.
#[derive(Debug)]
pub struct SimClock {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimClock {
    pub fn spawn(
        backend: Arc<SimulatedBackend>,
        samples_per_tick: usize,
        sample_rate: f64,
    ) -> Result<Self> {
        let period = Duration::from_secs_f64(samples_per_tick as f64 / sample_rate);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name("sim-clock".to_string())
            .spawn(move || {
                let mut next_tick = Instant::now() + period;
                while !flag.load(Ordering::Acquire) {
                    let now = Instant::now();
                    if now < next_tick {
                        thread::sleep((next_tick - now).min(Duration::from_millis(10)));
                        continue;
                    }
                    backend.advance(samples_per_tick);
                    next_tick += period;
                }
            })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }
}

impl Drop for SimClock {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
