//! Bridge membership resolution.
//!
//! A bridge groups game instances with the Discord channels of one guild.
//! Bridges come from two sources: the static list in the config file and a
//! dynamic, runtime-editable list persisted as JSON. Both are merged into an
//! immutable [`ResolvedBridges`] snapshot that is rebuilt in full and swapped
//! in whenever either source changes, so readers never observe a half-built
//! state.
//!
//! When both sources are empty the resolver runs in legacy single-bridge mode:
//! every query returns "no bridge" and every membership check passes.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use crate::common::error::PersistError;
use crate::common::persist::JsonFile;
use crate::config::types::BridgeConfig;

/// A bridge after merging both sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBridge {
    pub id: String,
    pub minecraft_instance_names: Vec<String>,
    pub public_channel_ids: Vec<u64>,
    pub officer_channel_ids: Vec<u64>,
}

impl From<&BridgeConfig> for ResolvedBridge {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            id: config.id.clone(),
            minecraft_instance_names: config.minecraft_instance_names.clone(),
            public_channel_ids: config.public_channel_ids.clone(),
            officer_channel_ids: config.officer_channel_ids.clone(),
        }
    }
}

/// Immutable lookup tables built from one version of the sources.
#[derive(Debug, Default)]
pub struct ResolvedBridges {
    bridges: Vec<ResolvedBridge>,
    /// Lowercased instance name -> bridge id.
    instance_to_bridge: HashMap<String, String>,
    public_channel_to_bridge: HashMap<u64, String>,
    officer_channel_to_bridge: HashMap<u64, String>,
}

impl ResolvedBridges {
    /// Merge static then dynamic entries; dynamic wins on id collision.
    fn build(static_bridges: &[BridgeConfig], dynamic_bridges: &[BridgeConfig]) -> Self {
        let mut bridges: Vec<ResolvedBridge> = Vec::new();

        for config in static_bridges.iter().chain(dynamic_bridges) {
            let resolved = ResolvedBridge::from(config);
            match bridges.iter_mut().find(|b| b.id == resolved.id) {
                Some(existing) => *existing = resolved,
                None => bridges.push(resolved),
            }
        }

        let mut instance_to_bridge = HashMap::new();
        let mut public_channel_to_bridge = HashMap::new();
        let mut officer_channel_to_bridge = HashMap::new();

        for bridge in &bridges {
            for instance in &bridge.minecraft_instance_names {
                if let Some(previous) =
                    instance_to_bridge.insert(instance.to_lowercase(), bridge.id.clone())
                {
                    warn!(
                        instance = %instance,
                        "Instance listed in bridges '{}' and '{}', using '{}'",
                        previous, bridge.id, bridge.id
                    );
                }
            }
            for channel in &bridge.public_channel_ids {
                public_channel_to_bridge.insert(*channel, bridge.id.clone());
            }
            for channel in &bridge.officer_channel_ids {
                officer_channel_to_bridge.insert(*channel, bridge.id.clone());
            }
        }

        Self {
            bridges,
            instance_to_bridge,
            public_channel_to_bridge,
            officer_channel_to_bridge,
        }
    }

    fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}

#[derive(Debug, Default)]
struct Sources {
    static_bridges: Vec<BridgeConfig>,
    dynamic_bridges: Vec<BridgeConfig>,
}

/// Resolves which bridge an instance or channel belongs to.
#[derive(Debug)]
pub struct BridgeResolver {
    sources: RwLock<Sources>,
    snapshot: RwLock<Arc<ResolvedBridges>>,
    dynamic_store: Option<JsonFile>,
}

impl BridgeResolver {
    /// Create a resolver with only a static source.
    pub fn new(static_bridges: Vec<BridgeConfig>) -> Self {
        let snapshot = ResolvedBridges::build(&static_bridges, &[]);
        Self {
            sources: RwLock::new(Sources {
                static_bridges,
                dynamic_bridges: Vec::new(),
            }),
            snapshot: RwLock::new(Arc::new(snapshot)),
            dynamic_store: None,
        }
    }

    /// Create a resolver whose dynamic source is persisted in `store`.
    pub fn with_dynamic_store(
        static_bridges: Vec<BridgeConfig>,
        store: JsonFile,
    ) -> Result<Self, PersistError> {
        let dynamic_bridges: Vec<BridgeConfig> = store.load()?;
        let snapshot = ResolvedBridges::build(&static_bridges, &dynamic_bridges);
        info!(
            static_bridges = static_bridges.len(),
            dynamic_bridges = dynamic_bridges.len(),
            "Loaded bridge configuration"
        );
        Ok(Self {
            sources: RwLock::new(Sources {
                static_bridges,
                dynamic_bridges,
            }),
            snapshot: RwLock::new(Arc::new(snapshot)),
            dynamic_store: Some(store),
        })
    }

    /// Replace the static source and rebuild.
    pub fn set_static(&self, bridges: Vec<BridgeConfig>) {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        sources.static_bridges = bridges;
        self.rebuild(&sources);
    }

    /// Replace the dynamic source, persist it and rebuild.
    pub fn set_dynamic(&self, bridges: Vec<BridgeConfig>) -> Result<(), PersistError> {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = &self.dynamic_store {
            store.save(&bridges)?;
        }
        sources.dynamic_bridges = bridges;
        self.rebuild(&sources);
        Ok(())
    }

    fn rebuild(&self, sources: &Sources) {
        let fresh = Arc::new(ResolvedBridges::build(
            &sources.static_bridges,
            &sources.dynamic_bridges,
        ));
        info!(bridges = fresh.bridges.len(), "Rebuilt bridge lookup tables");
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    /// Current immutable snapshot.
    pub fn snapshot(&self) -> Arc<ResolvedBridges> {
        Arc::clone(&self.snapshot.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// False only in legacy single-bridge mode (both sources empty).
    pub fn is_multi_bridge_enabled(&self) -> bool {
        !self.snapshot().is_empty()
    }

    /// Bridge of a game instance, case-insensitive.
    pub fn get_bridge_id_for_instance(&self, instance_name: &str) -> Option<String> {
        self.snapshot()
            .instance_to_bridge
            .get(&instance_name.to_lowercase())
            .cloned()
    }

    pub fn get_bridge_id_for_public_channel(&self, channel_id: u64) -> Option<String> {
        self.snapshot()
            .public_channel_to_bridge
            .get(&channel_id)
            .cloned()
    }

    pub fn get_bridge_id_for_officer_channel(&self, channel_id: u64) -> Option<String> {
        self.snapshot()
            .officer_channel_to_bridge
            .get(&channel_id)
            .cloned()
    }

    /// Bridge of a channel, whichever role it plays.
    pub fn get_bridge_id_for_channel(&self, channel_id: u64) -> Option<String> {
        let snapshot = self.snapshot();
        snapshot
            .public_channel_to_bridge
            .get(&channel_id)
            .or_else(|| snapshot.officer_channel_to_bridge.get(&channel_id))
            .cloned()
    }

    pub fn get_bridge(&self, bridge_id: &str) -> Option<ResolvedBridge> {
        self.snapshot()
            .bridges
            .iter()
            .find(|bridge| bridge.id == bridge_id)
            .cloned()
    }

    pub fn bridges(&self) -> Vec<ResolvedBridge> {
        self.snapshot().bridges.clone()
    }

    pub fn instances_for_bridge(&self, bridge_id: &str) -> Vec<String> {
        self.get_bridge(bridge_id)
            .map(|bridge| bridge.minecraft_instance_names)
            .unwrap_or_default()
    }

    /// Whether an instance should react to an event.
    ///
    /// True when the instance has no bridge, the event is global, or both
    /// belong to the same bridge. Always true in legacy mode.
    pub fn should_process_event(&self, event_bridge_id: Option<&str>, instance_name: &str) -> bool {
        if !self.is_multi_bridge_enabled() {
            return true;
        }
        let Some(event_bridge_id) = event_bridge_id else {
            return true;
        };
        match self.get_bridge_id_for_instance(instance_name) {
            None => true,
            Some(instance_bridge) => instance_bridge == event_bridge_id,
        }
    }

    /// Whether two bridge tags may see each other. `None` matches everything.
    pub fn bridges_match(&self, left: Option<&str>, right: Option<&str>) -> bool {
        if !self.is_multi_bridge_enabled() {
            return true;
        }
        match (left, right) {
            (Some(left), Some(right)) => left == right,
            _ => true,
        }
    }

    /// Public channels an event tagged `bridge_id` fans out to.
    ///
    /// Global events reach every bridge. Empty in legacy mode.
    pub fn public_channels_for(&self, bridge_id: Option<&str>) -> Vec<u64> {
        self.channels_for(bridge_id, |bridge| &bridge.public_channel_ids)
    }

    /// Officer channels an event tagged `bridge_id` fans out to.
    pub fn officer_channels_for(&self, bridge_id: Option<&str>) -> Vec<u64> {
        self.channels_for(bridge_id, |bridge| &bridge.officer_channel_ids)
    }

    fn channels_for<F>(&self, bridge_id: Option<&str>, select: F) -> Vec<u64>
    where
        F: Fn(&ResolvedBridge) -> &Vec<u64>,
    {
        let snapshot = self.snapshot();
        let mut channels: Vec<u64> = Vec::new();
        for bridge in &snapshot.bridges {
            if bridge_id.map_or(true, |id| id == bridge.id) {
                for channel in select(bridge) {
                    if !channels.contains(channel) {
                        channels.push(*channel);
                    }
                }
            }
        }
        channels
    }
}
