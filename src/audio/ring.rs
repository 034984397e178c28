//! Fixed-capacity circular sample buffer driven by the output callback.
//!
//! The buffer itself is plain single-owner data. It lives inside a
//! [`RingProcessor`] that the audio callback owns; the application side only
//! holds a [`RingHandle`] and talks to it through a command channel, so the
//! real-time thread never shares the sample array or the indices with anyone.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};

/// Control messages consumed by the callback side before each render.
#[derive(Debug, Clone, PartialEq)]
pub enum RingCommand {
    /// Append samples at the write position.
    Add(Vec<f32>),
    /// Upstream is exhausted; fire [`RingEvent::Ended`] once the buffer drains.
    Finish,
    /// Output silence until the next `Clear`, keeping buffered state.
    Stop,
    /// Full reset, including the priming window.
    Clear,
}

/// Notifications emitted by the callback side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingEvent {
    /// `Finish` was received and every buffered sample has been rendered.
    Ended,
    /// A write caught up with the read position; `dropped` unread samples
    /// were sacrificed.
    Overrun { dropped: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Priming,
    Playing,
    Draining,
    Stopped,
}

pub struct RingBuffer {
    samples: Box<[f32]>,
    write_index: usize,
    read_index: usize,
    frame_size: usize,
    priming_cycles: u32,
    priming_left: u32,
    started: bool,
    stopped: bool,
    finished: bool,
}

impl RingBuffer {
    /// Capacity is raised to at least two frames so an overrun always leaves
    /// room to advance the read side by one frame.
    #[must_use]
    pub fn new(capacity: usize, frame_size: usize, priming_cycles: u32) -> Self {
        let frame_size = frame_size.max(1);
        let capacity = capacity.max(frame_size * 2);

        Self {
            samples: vec![0.0; capacity].into_boxed_slice(),
            write_index: 0,
            read_index: 0,
            frame_size,
            priming_cycles,
            priming_left: priming_cycles,
            started: priming_cycles == 0,
            stopped: false,
            finished: false,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Samples written but not yet rendered.
    #[must_use]
    pub const fn available(&self) -> usize {
        let capacity = self.samples.len();
        (self.write_index + capacity - self.read_index) % capacity
    }

    #[must_use]
    pub const fn write_index(&self) -> usize {
        self.write_index
    }

    #[must_use]
    pub const fn read_index(&self) -> usize {
        self.read_index
    }

    #[must_use]
    pub const fn state(&self) -> RingState {
        if self.stopped {
            RingState::Stopped
        } else if !self.started {
            RingState::Priming
        } else if self.finished {
            RingState::Draining
        } else {
            RingState::Playing
        }
    }

    /// Copy `data` in at the write position and return how many unread
    /// samples were sacrificed to make room.
    pub fn write(&mut self, data: &[f32]) -> usize {
        let capacity = self.samples.len();
        let free = capacity - 1 - self.available();

        if data.len() <= free {
            let first = data.len().min(capacity - self.write_index);
            self.samples[self.write_index..self.write_index + first]
                .copy_from_slice(&data[..first]);
            self.samples[..data.len() - first].copy_from_slice(&data[first..]);
            self.write_index = (self.write_index + data.len()) % capacity;
            return 0;
        }

        // Slow path: the writer laps the reader. Every time the indices meet,
        // the oldest frame of unread audio is given up.
        let mut dropped = 0;
        for &sample in data {
            self.samples[self.write_index] = sample;
            self.write_index = (self.write_index + 1) % capacity;
            if self.write_index == self.read_index {
                self.read_index = (self.read_index + self.frame_size) % capacity;
                dropped += self.frame_size;
            }
        }
        dropped
    }

    pub const fn finish(&mut self) {
        self.finished = true;
    }

    pub const fn stop(&mut self) {
        self.stopped = true;
    }

    pub const fn clear(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
        self.priming_left = self.priming_cycles;
        self.started = self.priming_cycles == 0;
        self.stopped = false;
        self.finished = false;
    }

    /// Apply a control message. Only `Add` can produce an event (an overrun).
    pub fn apply(&mut self, command: RingCommand) -> Option<RingEvent> {
        match command {
            RingCommand::Add(data) => {
                let dropped = self.write(&data);
                (dropped > 0).then_some(RingEvent::Overrun { dropped })
            }
            RingCommand::Finish => {
                self.finish();
                None
            }
            RingCommand::Stop => {
                self.stop();
                None
            }
            RingCommand::Clear => {
                self.clear();
                None
            }
        }
    }

    /// Fill `out` completely: buffered samples first, silence for the rest.
    ///
    /// Never blocks and never allocates. Returns [`RingEvent::Ended`] on the
    /// first callback that starts with an empty buffer after `finish`.
    pub fn render(&mut self, out: &mut [f32]) -> Option<RingEvent> {
        if self.stopped {
            out.fill(0.0);
            return None;
        }

        if !self.started {
            out.fill(0.0);
            self.priming_left = self.priming_left.saturating_sub(1);
            if self.priming_left == 0 {
                self.started = true;
            }
            return None;
        }

        let capacity = self.samples.len();
        let available = self.available();
        let count = available.min(out.len());

        let first = count.min(capacity - self.read_index);
        out[..first].copy_from_slice(&self.samples[self.read_index..self.read_index + first]);
        out[first..count].copy_from_slice(&self.samples[..count - first]);
        out[count..].fill(0.0);
        self.read_index = (self.read_index + count) % capacity;

        if self.finished && available == 0 {
            self.finished = false;
            return Some(RingEvent::Ended);
        }

        None
    }
}

/// Occupancy published by the callback for the application side.
#[derive(Debug, Default)]
pub struct RingStats {
    available: AtomicUsize,
    /// Samples sent with `add` that the callback has not applied yet.
    queued: AtomicUsize,
    rendered: AtomicU64,
    draining: AtomicBool,
}

impl RingStats {
    fn publish(&self, ring: &RingBuffer, rendered: usize) {
        self.available.store(ring.available(), Ordering::Relaxed);
        self.draining
            .store(ring.state() == RingState::Draining, Ordering::Relaxed);
        self.rendered.fetch_add(rendered as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    /// Everything handed to the ring that has not been rendered yet.
    #[must_use]
    pub fn unplayed(&self) -> usize {
        self.available() + self.queued()
    }

    #[must_use]
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }
}

/// Callback-side owner of the ring buffer.
pub struct RingProcessor {
    ring: RingBuffer,
    commands: Receiver<RingCommand>,
    events: Sender<RingEvent>,
    stats: Arc<RingStats>,
}

impl RingProcessor {
    /// Apply queued commands, then render exactly `out.len()` samples.
    pub fn process(&mut self, out: &mut [f32]) {
        while let Ok(command) = self.commands.try_recv() {
            if let RingCommand::Add(ref data) = command {
                self.stats.queued.fetch_sub(data.len(), Ordering::Relaxed);
            }
            if let Some(event) = self.ring.apply(command) {
                self.emit(event);
            }
        }

        if let Some(event) = self.ring.render(out) {
            self.emit(event);
        }

        self.stats.publish(&self.ring, out.len());
    }

    fn emit(&self, event: RingEvent) {
        // try_send to stay wait-free in the audio callback
        let _ = self.events.try_send(event);
    }
}

/// Application-side handle to a ring buffer owned by the output callback.
#[derive(Clone)]
pub struct RingHandle {
    commands: Sender<RingCommand>,
    events: Receiver<RingEvent>,
    stats: Arc<RingStats>,
    sample_rate: u32,
}

impl RingHandle {
    pub fn add(&self, samples: Vec<f32>) {
        let len = samples.len();
        self.stats.queued.fetch_add(len, Ordering::Relaxed);
        if !self.send(RingCommand::Add(samples)) {
            self.stats.queued.fetch_sub(len, Ordering::Relaxed);
        }
    }

    pub fn finish(&self) {
        self.send(RingCommand::Finish);
    }

    pub fn stop(&self) {
        self.send(RingCommand::Stop);
    }

    pub fn clear(&self) {
        self.send(RingCommand::Clear);
    }

    fn send(&self, command: RingCommand) -> bool {
        let sent = self.commands.send(command).is_ok();
        if !sent {
            tracing::debug!("ring processor dropped, command discarded");
        }
        sent
    }

    #[must_use]
    pub fn events(&self) -> Receiver<RingEvent> {
        self.events.clone()
    }

    #[must_use]
    pub fn stats(&self) -> Arc<RingStats> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Split a ring buffer into its application handle and callback processor.
#[must_use]
pub fn channel(ring: RingBuffer, sample_rate: u32) -> (RingHandle, RingProcessor) {
    let (command_tx, command_rx) = unbounded();
    let (event_tx, event_rx) = bounded(64);
    let stats = Arc::new(RingStats::default());

    let handle = RingHandle {
        commands: command_tx,
        events: event_rx,
        stats: Arc::clone(&stats),
        sample_rate,
    };
    let processor = RingProcessor {
        ring,
        commands: command_rx,
        events: event_tx,
        stats,
    };
    (handle, processor)
}
