use std::{thread, time::Duration};

use anyhow::Result;
use image::{Rgb, RgbImage};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    capture::CaptureDevice,
    clock,
    detect::Tracker,
    frame::{FRAME_HEIGHT, FRAME_WIDTH, Frame},
    models::TrackedObject,
};

/// Frame pacing of the synthetic camera.
const SYNTHETIC_FPS: u64 = 30;

/// How many ticks a synthetic track lives before the tracker churns its id.
const TRACK_LIFETIME_TICKS: u32 = 120;

const MAX_ACTORS: usize = 5;

/// A camera stand-in producing a slowly shifting test pattern at a steady
/// rate, so the full pipeline can run without real capture hardware.
pub struct SyntheticDevice {
    tick: u64,
}

impl SyntheticDevice {
    pub fn new() -> Self {
        Self { tick: 0 }
    }
}

impl Default for SyntheticDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for SyntheticDevice {
    fn grab(&mut self) -> Result<Frame> {
        thread::sleep(Duration::from_millis(1_000 / SYNTHETIC_FPS));
        self.tick += 1;

        let shift = (self.tick % 256) as u32;
        let image = RgbImage::from_fn(FRAME_WIDTH, FRAME_HEIGHT, |x, y| {
            let band = ((x + shift) / 40) % 2;
            let base = if band == 0 { 24 } else { 40 };
            Rgb([base, base, (base + (y / 8) as u8).min(80)])
        });

        Ok(Frame::new(image, clock::now_ms()))
    }

    fn reopen(&mut self) -> Result<()> {
        Ok(())
    }
}

struct Actor {
    id: u64,
    x: f32,
    y: f32,
    vx: f32,
    vy: f32,
    age: u32,
}

/// A tracker stand-in: a handful of wandering "person" boxes whose track
/// ids churn the way a real tracker's do, with confidences straddling the
/// counting threshold.
pub struct SyntheticTracker {
    actors: Vec<Actor>,
    next_id: u64,
    rng: StdRng,
}

impl SyntheticTracker {
    pub fn new() -> Self {
        Self::with_seed(rand::rng().random())
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            actors: Vec::new(),
            next_id: 1,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn spawn_actor(&mut self) -> Actor {
        let id = self.next_id;
        self.next_id += 1;
        Actor {
            id,
            x: self.rng.random_range(0.0..(FRAME_WIDTH as f32 - 80.0)),
            y: self.rng.random_range(0.0..(FRAME_HEIGHT as f32 - 160.0)),
            vx: self.rng.random_range(-2.5..2.5),
            vy: self.rng.random_range(-1.0..1.0),
            age: 0,
        }
    }
}

impl Default for SyntheticTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracker for SyntheticTracker {
    fn track(&mut self, _frame: &Frame) -> Result<Vec<TrackedObject>> {
        // Retire old ids and occasionally walk-ins; both keep churn going.
        self.actors.retain(|actor| actor.age < TRACK_LIFETIME_TICKS);
        if self.actors.len() < MAX_ACTORS && self.rng.random_bool(0.08) {
            let actor = self.spawn_actor();
            self.actors.push(actor);
        }
        if self.actors.is_empty() {
            let actor = self.spawn_actor();
            self.actors.push(actor);
        }

        let mut objects = Vec::with_capacity(self.actors.len());
        for actor in &mut self.actors {
            actor.age += 1;
            actor.x = (actor.x + actor.vx).clamp(0.0, FRAME_WIDTH as f32 - 80.0);
            actor.y = (actor.y + actor.vy).clamp(0.0, FRAME_HEIGHT as f32 - 160.0);
            if actor.x <= 0.0 || actor.x >= FRAME_WIDTH as f32 - 80.0 {
                actor.vx = -actor.vx;
            }
            if actor.y <= 0.0 || actor.y >= FRAME_HEIGHT as f32 - 160.0 {
                actor.vy = -actor.vy;
            }

            let confidence = self.rng.random_range(0.70..0.99);
            objects.push(TrackedObject::new(
                Some(actor.id),
                "person",
                [actor.x, actor.y, actor.x + 80.0, actor.y + 160.0],
                confidence,
            ));
        }

        Ok(objects)
    }
}
