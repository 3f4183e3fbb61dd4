//! Animation loop driven by an external frame scheduler.
//!
//! The host owns the clock and calls `tick(time)` once per frame. The callback
//! receives its owner mutably, so it is taken out of the loop while it runs;
//! installing or clearing a callback from inside the callback wins over the
//! one being run.

/// Per-frame callback receiving the owner and the frame timestamp in
/// milliseconds.
pub type FrameCallback<T> = Box<dyn FnMut(&mut T, f64)>;

/// Installed callback plus the bookkeeping needed to run it re-entrantly.
pub struct AnimationLoop<T> {
    callback: Option<FrameCallback<T>>,
    generation: u64,
    frames: u64,
}

impl<T> Default for AnimationLoop<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for AnimationLoop<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationLoop")
            .field("running", &self.is_running())
            .field("frames", &self.frames)
            .finish()
    }
}

impl<T> AnimationLoop<T> {
    pub fn new() -> Self {
        Self {
            callback: None,
            generation: 0,
            frames: 0,
        }
    }

    /// Install a callback, or stop with `None`. A frame already running is
    /// not interrupted; the change applies from the next tick.
    pub fn set(&mut self, callback: Option<FrameCallback<T>>) {
        self.callback = callback;
        self.generation += 1;
    }

    pub fn is_running(&self) -> bool {
        self.callback.is_some()
    }

    /// Frames run so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }
}

/// Run one frame of the loop found through `animation`. Returns whether a
/// callback ran.
pub fn tick<T>(owner: &mut T, animation: fn(&mut T) -> &mut AnimationLoop<T>, time: f64) -> bool {
    let state = animation(owner);
    let Some(mut callback) = state.callback.take() else {
        return false;
    };
    let generation = state.generation;
    state.frames += 1;

    callback(owner, time);

    let state = animation(owner);
    if state.generation == generation {
        state.callback = Some(callback);
    }
    true
}
