//! Reduces a thread's raw transition log to non-overlapping intervals.
//!
//! Transitions are stored as masked ticks: the two top bits carry the kind,
//! the remaining 62 bits the tick relative to the tracker start.
//!
//! | bits 63..62 | kind                    |
//! |-------------|-------------------------|
//! | `00`        | activation              |
//! | `01`        | tentative deactivation  |
//! | `10`        | confirmed deactivation  |

pub const TRANSITION_SHIFT: u32 = 62;
pub const TIMESTAMP_MASK: i64 = !(0b11 << TRANSITION_SHIFT);

const TENTATIVE_BITS: i64 = 0b01 << TRANSITION_SHIFT;
const CONFIRMED_BITS: i64 = 0b10 << TRANSITION_SHIFT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    Activation,
    /// A deactivation that a following activation may retract.
    TentativeDeactivation,
    Deactivation,
}

/// A tick tagged with the transition that happened at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaskedTick(i64);

impl MaskedTick {
    pub fn new(transition: Transition, tick: i64) -> Self {
        let bits = match transition {
            Transition::Activation => 0,
            Transition::TentativeDeactivation => TENTATIVE_BITS,
            Transition::Deactivation => CONFIRMED_BITS,
        };
        Self((tick & TIMESTAMP_MASK) | bits)
    }

    pub fn activation(tick: i64) -> Self {
        Self::new(Transition::Activation, tick)
    }

    pub fn deactivation(tick: i64, tentative: bool) -> Self {
        if tentative {
            Self::new(Transition::TentativeDeactivation, tick)
        } else {
            Self::new(Transition::Deactivation, tick)
        }
    }

    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn tick(self) -> i64 {
        self.0 & TIMESTAMP_MASK
    }

    /// The reserved pattern `11` is read as a confirmed deactivation.
    pub fn transition(self) -> Transition {
        match (self.0 >> TRANSITION_SHIFT) & 0b11 {
            0b00 => Transition::Activation,
            0b01 => Transition::TentativeDeactivation,
            _ => Transition::Deactivation,
        }
    }
}

/// Flat `[start, end, start, end, ...]` list of unmasked ticks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunedIntervals(Vec<i64>);

impl PrunedIntervals {
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<i64> {
        self.0
    }

    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.0.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pairs(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.0.chunks_exact(2).map(|p| (p[0], p[1]))
    }

    fn emit(&mut self, start: i64, end: i64) {
        // Out-of-order ticks would produce a negative length; skip them.
        if end >= start {
            self.0.push(start);
            self.0.push(end);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Window {
    Idle,
    Open { start: i64 },
    Pending { start: i64, end: i64 },
}

/// Single-pass interval pruner. Holds no state between calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntervalSequencePruner;

impl IntervalSequencePruner {
    pub fn new() -> Self {
        Self
    }

    /// Prune raw masked ticks. `finish` closes a window left open at the end.
    pub fn prune<I>(&self, raw: I, finish: i64) -> PrunedIntervals
    where
        I: IntoIterator<Item = i64>,
    {
        let mut out = PrunedIntervals::default();
        let mut window = Window::Idle;
        for value in raw {
            let masked = MaskedTick::from_raw(value);
            let tick = masked.tick();
            window = match (masked.transition(), window) {
                (Transition::Activation, Window::Idle) => Window::Open { start: tick },
                (Transition::Activation, Window::Open { start })
                | (Transition::Activation, Window::Pending { start, .. }) => Window::Open { start },
                (Transition::TentativeDeactivation, Window::Idle) => Window::Idle,
                (Transition::TentativeDeactivation, Window::Open { start })
                | (Transition::TentativeDeactivation, Window::Pending { start, .. }) => {
                    Window::Pending { start, end: tick }
                }
                (Transition::Deactivation, Window::Idle) => Window::Idle,
                (Transition::Deactivation, Window::Open { start })
                | (Transition::Deactivation, Window::Pending { start, .. }) => {
                    out.emit(start, tick);
                    Window::Idle
                }
            };
        }
        match window {
            Window::Idle => {}
            Window::Open { start } => out.emit(start, finish & TIMESTAMP_MASK),
            Window::Pending { start, end } => out.emit(start, end),
        }
        out
    }
}
