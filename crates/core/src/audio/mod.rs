//! Capability surface of the audio middleware consumed by the timeline bridge.
//!
//! The bridge never talks to a concrete engine; it only needs the operations
//! on [`AudioBackend`]. [`simulated::SimulatedEngine`] provides an in-process
//! implementation used by the tests and by the command line demo.

pub mod simulated;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::timeline::TimelineKey;

/// Opaque reference to an authored event description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub(crate) u64);

/// Opaque reference to an engine-managed playback instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub(crate) u64);

impl fmt::Display for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// How playback should end when an instance is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopMode {
    /// Let the event fade out according to its authored envelope.
    AllowFadeout,
    /// Cut playback off at once.
    Immediate,
}

/// Timeline notification payloads delivered to instance callbacks.
/// Positions are in milliseconds from the start of the event.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackKind {
    /// Beat boundary; `beat` is 1-based within the bar, `bar` is 1-based.
    Beat {
        beat: i32,
        bar: i32,
        tempo: f32,
        position: i32,
    },
    /// Authored marker reached.
    Marker { name: String, position: i32 },
}

impl CallbackKind {
    fn mask_bit(&self) -> CallbackMask {
        match self {
            Self::Beat { .. } => CallbackMask::BEAT,
            Self::Marker { .. } => CallbackMask::MARKER,
        }
    }
}

/// Set of callback kinds an instance callback is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackMask(u8);

impl CallbackMask {
    /// No notifications.
    pub const NONE: Self = Self(0);
    pub const BEAT: Self = Self(1);
    pub const MARKER: Self = Self(1 << 1);

    /// Whether every kind in `other` is also in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether a callback registered with this mask should see `kind`.
    pub fn accepts(self, kind: &CallbackKind) -> bool {
        self.contains(kind.mask_bit())
    }
}

impl std::ops::BitOr for CallbackMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Status handed back to the engine by a callback. The engine contract
/// requires a status even when the callback failed internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Callback handled, or its failure was logged.
    Ok,
}

/// Callback registered on an instance. Invoked from the engine's own thread.
pub type InstanceCallback =
    Arc<dyn Fn(&dyn AudioBackend, InstanceHandle, &CallbackKind) -> CallbackStatus + Send + Sync>;

/// Failures reported by an audio engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("event `{0}` not found")]
    EventNotFound(String),
    #[error("handle is invalid or has been released")]
    InvalidHandle,
    #[error("engine rejected the call: {0}")]
    Rejected(String),
    #[error("event `{name}` is invalid: {reason}")]
    InvalidEvent { name: String, reason: String },
}

/// Result alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Operations the timeline bridge needs from an audio engine.
pub trait AudioBackend: Send + Sync {
    /// Looks up an authored event by name. Unknown names fail with
    /// [`EngineError::EventNotFound`].
    fn resolve_event(&self, name: &str) -> EngineResult<EventHandle>;
    /// Creates a stopped playback instance of `event`.
    fn create_instance(&self, event: EventHandle) -> EngineResult<InstanceHandle>;
    /// Static length of the event in milliseconds.
    fn event_length(&self, event: EventHandle) -> EngineResult<i32>;
    /// Attaches opaque user data to an instance; `None` clears it.
    fn set_user_data(&self, instance: InstanceHandle, data: Option<TimelineKey>)
        -> EngineResult<()>;
    /// User data previously attached with [`set_user_data`](Self::set_user_data).
    fn user_data(&self, instance: InstanceHandle) -> EngineResult<Option<TimelineKey>>;
    /// Replaces the instance callback. Only kinds in `mask` are delivered.
    fn set_callback(
        &self,
        instance: InstanceHandle,
        callback: InstanceCallback,
        mask: CallbackMask,
    ) -> EngineResult<()>;
    /// Requests playback start.
    fn start(&self, instance: InstanceHandle) -> EngineResult<()>;
    /// Current playback position in milliseconds.
    fn timeline_position(&self, instance: InstanceHandle) -> EngineResult<i32>;
    fn stop(&self, instance: InstanceHandle, mode: StopMode) -> EngineResult<()>;
    /// Frees the instance. The handle is invalid afterwards.
    fn release(&self, instance: InstanceHandle) -> EngineResult<()>;
}
