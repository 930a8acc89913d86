//! Subscription registry: channel label → views watching it

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::channel::ChannelLabel;
use crate::view::{LiveView, ViewId};

struct Registration {
    view: Arc<dyn LiveView>,
    channels: Vec<ChannelLabel>,
}

/// Registry for dispatching notifications to views
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: HashMap<ViewId, Registration>,
    by_channel: HashMap<ChannelLabel, Vec<ViewId>>,
}

impl SubscriptionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a view under each channel. Duplicate channels count once.
    ///
    /// Re-registering a view replaces its previous channel set.
    pub fn register(&mut self, view: Arc<dyn LiveView>, channels: Vec<ChannelLabel>) {
        let id = view.view_id();
        self.unregister(id);

        let mut seen = HashSet::new();
        let channels: Vec<ChannelLabel> = channels
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .collect();
        for channel in &channels {
            self.by_channel.entry(channel.clone()).or_default().push(id);
        }
        self.entries.insert(id, Registration { view, channels });
    }

    /// Remove a view. Returns false if it was not registered.
    pub fn unregister(&mut self, id: ViewId) -> bool {
        let Some(registration) = self.entries.remove(&id) else {
            return false;
        };
        for channel in &registration.channels {
            if let Some(ids) = self.by_channel.get_mut(channel) {
                ids.retain(|v| *v != id);
                if ids.is_empty() {
                    self.by_channel.remove(channel);
                }
            }
        }
        true
    }

    /// Invalidate every view registered under `channel`.
    ///
    /// Returns how many views changed state. Views found disposed are
    /// dropped from the registry.
    pub fn dispatch(&mut self, channel: &ChannelLabel) -> usize {
        let Some(ids) = self.by_channel.get(channel) else {
            return 0;
        };
        let mut invalidated = 0;
        let mut disposed = Vec::new();
        for id in ids {
            let Some(registration) = self.entries.get(id) else {
                continue;
            };
            if registration.view.is_disposed() {
                disposed.push(*id);
                continue;
            }
            if registration.view.invalidate() {
                invalidated += 1;
            }
        }
        for id in disposed {
            self.unregister(id);
        }
        invalidated
    }

    pub fn is_registered(&self, id: ViewId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Channels a view is registered under.
    pub fn channels_of(&self, id: ViewId) -> Vec<ChannelLabel> {
        self.entries
            .get(&id)
            .map(|r| r.channels.clone())
            .unwrap_or_default()
    }

    /// Number of views registered under `channel`.
    pub fn subscriber_count(&self, channel: &ChannelLabel) -> usize {
        self.by_channel.get(channel).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("views", &self.entries.len())
            .field("channels", &self.by_channel.len())
            .finish()
    }
}
