//! Core library for the timeline sync bridge.
//!
//! The crate connects a host component lifecycle to an audio middleware's
//! timeline callbacks. A [`TimelineBridge`] owns one playing music event and a
//! [`SharedTimeline`] record that engine callbacks update with beats and
//! markers from their own thread. Marker names may carry `{name=value}`
//! metadata which the [`decoder`] turns into a [`ParameterMap`].

pub mod audio;
pub mod bridge;
pub mod config;
pub mod decoder;
pub mod diagnostics;
pub mod error;
pub mod events;
pub mod timeline;

pub use audio::simulated::{EventDescriptor, MarkerDescriptor, SimulatedEngine};
pub use audio::{AudioBackend, EngineError, InstanceHandle, StopMode};
pub use bridge::{BridgeState, TimelineBridge, TimelineCallbackHandler};
pub use config::{AppConfig, BridgeConfig, EngineConfig};
pub use decoder::{decode, ParameterMap};
pub use diagnostics::{DiagnosticsSink, RecordingSink, TracingSink};
pub use error::{Result, SyncError};
pub use events::{BeatEvent, MarkerEvent, TimelineEvent, TimelineEvents};
pub use timeline::{SharedTimeline, TimelineInfo, TimelineKey, TimelineRegistry};
