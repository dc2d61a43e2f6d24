//! Per-player input ring for lockstep execution.
//!
//! A two-dimensional ring `[player][frame % RING_SIZE]`; each cell holds
//! one input frame and a `ready` flag. Cells are populated `delay` frames
//! ahead of consumption and consumed exactly once. The ring is large
//! enough that a slot can never be overwritten before it is consumed
//! (`RING_SIZE >= 2 * max delay` with room to spare).

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use kestrel_netproto::input::InputFrame;

/// Ring capacity in frames. Power of two; frame numbers index modulo this.
pub const RING_SIZE: usize = 256;

#[derive(Clone, Copy)]
struct Cell {
    input: InputFrame,
    ready: bool,
}

struct RingState {
    cells: Vec<Cell>, // players * RING_SIZE
}

pub struct InputRing {
    state: Mutex<RingState>,
    cond: Condvar,
    players: usize,
}

impl InputRing {
    /// Create a ring for `players` participants, with slots `[0, delay)`
    /// pre-filled with neutral input so the pipeline can run from frame 0
    /// without stalling.
    pub fn new(players: usize, delay: u32) -> Self {
        let mut cells = vec![
            Cell {
                input: InputFrame::neutral(0),
                ready: false,
            };
            players * RING_SIZE
        ];
        for p in 0..players {
            for f in 0..delay {
                let cell = &mut cells[p * RING_SIZE + (f as usize % RING_SIZE)];
                cell.input = InputFrame::neutral(f);
                cell.ready = true;
            }
        }
        Self {
            state: Mutex::new(RingState { cells }),
            cond: Condvar::new(),
            players,
        }
    }

    pub fn players(&self) -> usize {
        self.players
    }

    /// Store `input` (whose `frame` field is authoritative) for `player`
    /// and flag the slot ready.
    pub fn set(&self, player: usize, input: InputFrame) {
        if player >= self.players {
            return;
        }
        let idx = player * RING_SIZE + (input.frame as usize % RING_SIZE);
        {
            let mut state = self.state.lock();
            state.cells[idx] = Cell { input, ready: true };
        }
        self.cond.notify_all();
    }

    /// Whether every player's slot for `frame` is ready.
    pub fn ready_for(&self, frame: u32) -> bool {
        let state = self.state.lock();
        self.ready_locked(&state, frame)
    }

    fn ready_locked(&self, state: &RingState, frame: u32) -> bool {
        let slot = frame as usize % RING_SIZE;
        (0..self.players).all(|p| state.cells[p * RING_SIZE + slot].ready)
    }

    /// Block until `frame` is ready or `timeout` elapses. Returns whether
    /// the frame became ready.
    pub fn wait_ready(&self, frame: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !self.ready_locked(&state, frame) {
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return self.ready_locked(&state, frame);
            }
        }
        true
    }

    /// Consume the row for `frame`: returns every player's input and
    /// clears the ready flags. Returns `None` if any slot was not ready -
    /// consuming an unready row is a lockstep violation, not a race to
    /// paper over.
    pub fn take_row(&self, frame: u32) -> Option<Vec<InputFrame>> {
        let slot = frame as usize % RING_SIZE;
        let mut state = self.state.lock();
        if !self.ready_locked(&state, frame) {
            return None;
        }
        let mut row = Vec::with_capacity(self.players);
        for p in 0..self.players {
            let cell = &mut state.cells[p * RING_SIZE + slot];
            row.push(cell.input);
            cell.ready = false;
        }
        Some(row)
    }

    /// Clear all slots (session restart).
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for cell in &mut state.cells {
            cell.ready = false;
        }
    }

    /// Re-seed neutral input for `[base, base + delay)` (used when the
    /// starting frame is moved by the host).
    pub fn prefill(&self, base: u32, delay: u32) {
        let mut state = self.state.lock();
        for p in 0..self.players {
            for f in base..base + delay {
                let cell = &mut state.cells[p * RING_SIZE + (f as usize % RING_SIZE)];
                cell.input = InputFrame::neutral(f);
                cell.ready = true;
            }
        }
        drop(state);
        self.cond.notify_all();
    }
}
