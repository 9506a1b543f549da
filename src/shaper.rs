//! Per-chunk impairment policy.
//!
//! The shaper decides, for each chunk read by a forwarder, whether it goes out
//! now, later, or never:
//!
//! | Mode           | Effect                                                   |
//! |----------------|----------------------------------------------------------|
//! | `Transparent`  | Forward unchanged.                                       |
//! | `RandomDelay`  | Sleep `U[delay_min, delay_max]` seconds, then forward.   |
//! | `Drop`         | Discard with probability `drop_rate`.                    |
//! | `Reorder`      | Hold up to `reorder_window` chunks, release one at random.|
//!
//! The only state is the [`ReorderBuffer`], which is owned by the calling
//! forwarder so no two directions or sessions ever share one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::{AttackMode, ShaperConfig, MAX_DELAY_SECS};

/// One transport-level read. Carries no application message boundary.
pub type Chunk = Vec<u8>;

/// Outcome of shaping a single chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shaped {
    /// Write this chunk to the destination now.
    Forward(Chunk),
    /// Write this chunk now; it was released from the reorder buffer ahead of
    /// a chunk that arrived after it.
    Reordered(Chunk),
    /// Chunk was buffered; nothing to write this round.
    Hold,
    /// Chunk was discarded.
    Drop,
}

impl Shaped {
    /// The chunk to write, if any.
    pub fn into_chunk(self) -> Option<Chunk> {
        match self {
            Shaped::Forward(chunk) | Shaped::Reordered(chunk) => Some(chunk),
            Shaped::Hold | Shaped::Drop => None,
        }
    }
}

/// A chunk released from a [`ReorderBuffer`] together with the slot it was
/// taken from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub chunk: Chunk,
    pub position: usize,
    /// False when the released chunk was the newest one in the buffer.
    pub out_of_order: bool,
}

/// Fixed-capacity buffer of pending chunks in arrival order.
///
/// The buffer never holds more than `window` chunks: the push that fills it
/// immediately removes one chunk at a uniformly random position and hands it
/// back, so between reads the length stays below `window`.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: VecDeque<Chunk>,
    window: usize,
}

impl ReorderBuffer {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            pending: VecDeque::with_capacity(window),
            window,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Appends `chunk`; once the window is reached, removes and returns a
    /// random pending chunk.
    pub fn push<R: Rng + ?Sized>(&mut self, chunk: Chunk, rng: &mut R) -> Option<Released> {
        self.pending.push_back(chunk);
        if self.pending.len() < self.window {
            return None;
        }

        let newest = self.pending.len() - 1;
        let position = rng.gen_range(0..self.pending.len());
        self.pending.remove(position).map(|chunk| Released {
            chunk,
            position,
            out_of_order: position != newest,
        })
    }

    /// Removes every pending chunk, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Chunk> + '_ {
        self.pending.drain(..)
    }
}

/// Stateless shaping policy shared by every forwarder in the process.
#[derive(Debug, Clone)]
pub struct Shaper {
    config: Arc<ShaperConfig>,
}

impl Shaper {
    pub fn new(config: Arc<ShaperConfig>) -> Self {
        Self { config }
    }

    pub fn mode(&self) -> AttackMode {
        self.config.mode
    }

    pub fn config(&self) -> &ShaperConfig {
        &self.config
    }

    /// A fresh buffer for one direction, or `None` when the mode never holds
    /// chunks.
    pub fn new_reorder_buffer(&self) -> Option<ReorderBuffer> {
        match self.config.mode {
            AttackMode::Reorder => Some(ReorderBuffer::new(self.config.reorder_window)),
            _ => None,
        }
    }

    /// Draws a delay uniformly from `[delay_min, delay_max]`, capped at
    /// [`MAX_DELAY_SECS`]. Bounds that cannot form a delay yield zero.
    pub fn sample_delay(&self) -> Duration {
        let (min, max) = (self.config.delay_min, self.config.delay_max);
        let secs = if min < max {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::try_from_secs_f64(secs.min(MAX_DELAY_SECS)).unwrap_or(Duration::ZERO)
    }

    fn should_drop(&self) -> bool {
        rand::thread_rng().gen::<f64>() < self.config.drop_rate
    }

    /// Applies the configured mode to one chunk.
    ///
    /// In `RandomDelay` mode this suspends the caller for the drawn delay;
    /// only the calling task is held up.
    pub async fn shape(&self, chunk: Chunk, buffer: Option<&mut ReorderBuffer>) -> Shaped {
        match self.config.mode {
            AttackMode::Transparent => Shaped::Forward(chunk),

            AttackMode::RandomDelay => {
                let delay = self.sample_delay();
                warn!("MODE = random_delay: delaying {:.2}s", delay.as_secs_f64());
                sleep(delay).await;
                Shaped::Forward(chunk)
            }

            AttackMode::Drop => {
                if self.should_drop() {
                    warn!(
                        "MODE = drop: chunk of {} bytes DROPPED (drop_rate={})",
                        chunk.len(),
                        self.config.drop_rate
                    );
                    Shaped::Drop
                } else {
                    Shaped::Forward(chunk)
                }
            }

            AttackMode::Reorder => {
                let Some(buffer) = buffer else {
                    return Shaped::Forward(chunk);
                };
                let released = buffer.push(chunk, &mut rand::thread_rng());
                match released {
                    Some(released) => {
                        warn!(
                            "MODE = reorder: sending chunk from position {} (buffer: {}/{})",
                            released.position,
                            buffer.len(),
                            buffer.window()
                        );
                        if released.out_of_order {
                            Shaped::Reordered(released.chunk)
                        } else {
                            Shaped::Forward(released.chunk)
                        }
                    }
                    None => {
                        debug!(
                            "MODE = reorder: buffering chunk (buffer: {}/{})",
                            buffer.len(),
                            buffer.window()
                        );
                        Shaped::Hold
                    }
                }
            }
        }
    }
}
