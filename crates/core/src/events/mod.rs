//! Publish point for beat and marker notifications.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::decoder::ParameterMap;
use crate::{Result, SyncError};

/// Musical beat boundary reached by the playing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatEvent {
    /// Beat within the bar, starting at 1.
    pub beat: i32,
    /// Bar, starting at 1.
    pub bar: i32,
    pub tempo: f32,
    /// Timeline position of the beat in milliseconds.
    pub position: i32,
}

/// Authored timeline marker passed by the playing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerEvent {
    pub name: String,
    pub position: i32,
    /// `{name=value}` metadata decoded from the marker name. `None` when the
    /// name could not be decoded.
    pub parameters: Option<ParameterMap>,
}

/// Any notification published by a bridge, as delivered to channel
/// subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimelineEvent {
    Beat(BeatEvent),
    Marker(MarkerEvent),
}

type BeatListener = Arc<dyn Fn(&BeatEvent) + Send + Sync>;
type MarkerListener = Arc<dyn Fn(&MarkerEvent) + Send + Sync>;

#[derive(Default)]
struct Subscribers {
    beat: Vec<BeatListener>,
    marker: Vec<MarkerListener>,
    channels: Vec<Sender<TimelineEvent>>,
}

/// Subscriber registry shared between a bridge and its engine callback.
///
/// Listeners run on the engine's callback thread and should return quickly.
/// Events are published while the bridge's timeline record is still
/// registered, so once `TimelineBridge::shutdown` returns no further events
/// are delivered. A listener must not shut down the bridge that published
/// it, as shutdown waits for in-flight listeners.
#[derive(Clone, Default)]
pub struct TimelineEvents {
    subscribers: Arc<RwLock<Subscribers>>,
}

impl TimelineEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for beat boundaries.
    pub fn on_beat<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&BeatEvent) + Send + Sync + 'static,
    {
        let mut subscribers = self.write()?;
        subscribers.beat.push(Arc::new(listener));
        Ok(())
    }

    /// Registers a listener for timeline markers.
    pub fn on_marker<F>(&self, listener: F) -> Result<()>
    where
        F: Fn(&MarkerEvent) + Send + Sync + 'static,
    {
        let mut subscribers = self.write()?;
        subscribers.marker.push(Arc::new(listener));
        Ok(())
    }

    /// Returns a channel receiving every beat and marker event. The sender is
    /// dropped once the receiver goes away.
    pub fn subscribe(&self) -> Result<Receiver<TimelineEvent>> {
        let (tx, rx) = mpsc::channel();
        self.write()?.channels.push(tx);
        Ok(rx)
    }

    pub(crate) fn publish(&self, event: TimelineEvent) -> Result<()> {
        // Listeners are cloned out so they may subscribe further without
        // deadlocking on the registry.
        let (beat, marker, has_channels) = {
            let subscribers = self.read()?;
            (
                subscribers.beat.clone(),
                subscribers.marker.clone(),
                !subscribers.channels.is_empty(),
            )
        };

        match &event {
            TimelineEvent::Beat(beat_event) => beat.iter().for_each(|l| l(beat_event)),
            TimelineEvent::Marker(marker_event) => marker.iter().for_each(|l| l(marker_event)),
        }

        if has_channels {
            let mut subscribers = self.write()?;
            subscribers
                .channels
                .retain(|tx| tx.send(event.clone()).is_ok());
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Subscribers>> {
        self.subscribers
            .read()
            .map_err(|_| SyncError::msg("timeline subscribers have been poisoned"))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Subscribers>> {
        self.subscribers
            .write()
            .map_err(|_| SyncError::msg("timeline subscribers have been poisoned"))
    }
}

impl std::fmt::Debug for TimelineEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineEvents").finish()
    }
}
