//! Shared timeline records and the registry that lends them to the engine.
//!
//! The engine never holds a record directly. It is handed a [`TimelineKey`]
//! as instance user data and callbacks resolve that key through the
//! [`TimelineRegistry`]. Revoking a key makes every later lookup miss.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

use crate::{Result, SyncError};

/// Plain snapshot of a shared timeline record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineInfo {
    /// Total length of the event in milliseconds.
    pub length: i32,
    /// Playback position in milliseconds, refreshed every tick.
    pub position: i32,
    pub beat: i32,
    pub bar: i32,
    pub tempo: f32,
    /// Name of the last marker passed, empty until the first one.
    pub last_marker: String,
}

impl fmt::Display for TimelineInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Length (ms): {}, Tempo: {}", self.length, self.tempo)?;
        writeln!(f, "Playback Position (ms): {}", self.position)?;
        writeln!(f, "Current Bar: {}, Current Beat: {}", self.bar, self.beat)?;
        write!(f, "Last Marker: {}", self.last_marker)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BeatState {
    beat: i32,
    bar: i32,
    tempo: f32,
}

/// Live timeline record shared between the bridge and engine callbacks.
///
/// Fields are grouped by writer: `length` is written once at setup,
/// `position` only by the per-frame tick, the beat group only by beat
/// callbacks and `last_marker` only by marker callbacks. Each group has its
/// own storage so writers never contend with one another.
#[derive(Debug, Default)]
pub struct SharedTimeline {
    length: AtomicI32,
    position: AtomicI32,
    beat: Mutex<BeatState>,
    last_marker: Mutex<String>,
}

impl SharedTimeline {
    /// Static event length in milliseconds.
    pub fn length(&self) -> i32 {
        self.length.load(Ordering::Acquire)
    }

    /// Position recorded by the last tick, in milliseconds.
    pub fn position(&self) -> i32 {
        self.position.load(Ordering::Acquire)
    }

    pub(crate) fn set_length(&self, length: i32) {
        self.length.store(length, Ordering::Release);
    }

    pub(crate) fn set_position(&self, position: i32) {
        self.position.store(position, Ordering::Release);
    }

    pub(crate) fn record_beat(&self, beat: i32, bar: i32, tempo: f32) -> Result<()> {
        let mut state = self.lock_beat()?;
        *state = BeatState { beat, bar, tempo };
        Ok(())
    }

    pub(crate) fn record_marker(&self, name: &str) -> Result<()> {
        let mut marker = self.lock_marker()?;
        marker.clear();
        marker.push_str(name);
        Ok(())
    }

    /// Copies the current field values into a [`TimelineInfo`].
    pub fn snapshot(&self) -> Result<TimelineInfo> {
        let beat = *self.lock_beat()?;
        let last_marker = self.lock_marker()?.clone();
        Ok(TimelineInfo {
            length: self.length(),
            position: self.position(),
            beat: beat.beat,
            bar: beat.bar,
            tempo: beat.tempo,
            last_marker,
        })
    }

    fn lock_beat(&self) -> Result<MutexGuard<'_, BeatState>> {
        self.beat
            .lock()
            .map_err(|_| SyncError::msg("timeline beat state has been poisoned"))
    }

    fn lock_marker(&self) -> Result<MutexGuard<'_, String>> {
        self.last_marker
            .lock()
            .map_err(|_| SyncError::msg("timeline marker state has been poisoned"))
    }
}

/// Non-owning, generation-checked reference to a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimelineKey {
    index: u32,
    generation: u32,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    timeline: Option<Arc<SharedTimeline>>,
}

/// Arena of live timeline records addressed by [`TimelineKey`].
#[derive(Debug, Default)]
pub struct TimelineRegistry {
    slots: RwLock<Vec<Slot>>,
}

impl TimelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a zeroed record and returns its key together with the owning
    /// handle.
    pub fn insert(&self) -> Result<(TimelineKey, Arc<SharedTimeline>)> {
        let timeline = Arc::new(SharedTimeline::default());
        let mut slots = self.write()?;

        let index = match slots.iter().position(|slot| slot.timeline.is_none()) {
            Some(index) => index,
            None => {
                slots.push(Slot::default());
                slots.len() - 1
            }
        };
        let slot = &mut slots[index];
        slot.timeline = Some(timeline.clone());

        let key = TimelineKey {
            index: u32::try_from(index).map_err(|_| SyncError::msg("timeline registry is full"))?,
            generation: slot.generation,
        };
        Ok((key, timeline))
    }

    /// Runs `f` against the record behind `key` while the registry read guard
    /// is held, so a concurrent [`revoke`](Self::revoke) waits for the write
    /// to finish. Returns `None` when the key is stale.
    pub fn with<R>(
        &self,
        key: TimelineKey,
        f: impl FnOnce(&SharedTimeline) -> R,
    ) -> Result<Option<R>> {
        let slots = self.read()?;
        Ok(Self::lookup(&slots, key).map(f))
    }

    /// Whether `key` still names a live record.
    pub fn contains(&self, key: TimelineKey) -> Result<bool> {
        let slots = self.read()?;
        Ok(Self::lookup(&slots, key).is_some())
    }

    /// Drops the registry's reference and invalidates `key`. Returns whether
    /// the key was still live.
    pub fn revoke(&self, key: TimelineKey) -> Result<bool> {
        let mut slots = self.write()?;
        let Some(slot) = slots.get_mut(key.index as usize) else {
            return Ok(false);
        };
        if slot.generation != key.generation || slot.timeline.is_none() {
            return Ok(false);
        }
        slot.timeline = None;
        slot.generation = slot.generation.wrapping_add(1);
        Ok(true)
    }

    /// Number of live records.
    pub fn len(&self) -> Result<usize> {
        let slots = self.read()?;
        Ok(slots.iter().filter(|slot| slot.timeline.is_some()).count())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn lookup(slots: &[Slot], key: TimelineKey) -> Option<&SharedTimeline> {
        slots
            .get(key.index as usize)
            .filter(|slot| slot.generation == key.generation)
            .and_then(|slot| slot.timeline.as_deref())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Vec<Slot>>> {
        self.slots
            .read()
            .map_err(|_| SyncError::msg("timeline registry has been poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<Slot>>> {
        self.slots
            .write()
            .map_err(|_| SyncError::msg("timeline registry has been poisoned"))
    }
}
