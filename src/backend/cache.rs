//! Shared cache layer
//!
//! Memoized lookup tables derived from the active catalog, vector store and
//! property header. Every slot is filled on first use and cleared as one unit
//! by [`CacheLayer::invalidate_all`] or [`CacheLayer::replace_sources`].
//!
//! | Entry | Primary | Secondary |
//! |---|---|---|
//! | [`frame_ids`](CacheLayer::frame_ids) | catalog frames | vector store frame table |
//! | [`signal_names_by_property`](CacheLayer::signal_names_by_property) | vector store property row | property header |
//! | [`property_ids`](CacheLayer::property_ids) | property header | vector store cell scan |
//! | [`matcher`](CacheLayer::matcher) | compiled on first use | |
//! | [`time_series`](CacheLayer::time_series) | vector store | |
//! | [`signal_frames`](CacheLayer::signal_frames) | catalog frames | |
//! | [`header_kinds`](CacheLayer::header_kinds) | property header | |
//!
//! [`property_view`](CacheLayer::property_view) reads the property entries
//! together so a poll never mixes two generations.
//!
//! The secondary source is used wholesale, only when the primary yields
//! nothing. Slow reads run outside the lock; a result computed against
//! sources that were replaced in the meantime is discarded and recomputed.

use crate::backend::catalog::Catalog;
use crate::backend::property_dump::PropertyMatcher;
use crate::backend::property_header::PropertyHeader;
use crate::backend::vector_store::VectorStore;
use crate::error::Result;
use crate::types::{CanId, PropertyId, SignalTimeSeries, ValueKind};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// The data sources the caches are derived from
#[derive(Clone)]
pub struct Sources {
    pub catalog: Arc<dyn Catalog>,
    pub store: Arc<dyn VectorStore>,
    pub header: Option<Arc<PropertyHeader>>,
}

impl Sources {
    pub fn new(catalog: Arc<dyn Catalog>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            catalog,
            store,
            header: None,
        }
    }

    pub fn with_header(mut self, header: PropertyHeader) -> Self {
        self.header = Some(Arc::new(header));
        self
    }
}

impl std::fmt::Debug for Sources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sources")
            .field("header", &self.header.as_ref().map(|h| h.len()))
            .finish_non_exhaustive()
    }
}

pub type FrameIdMap = BTreeMap<String, CanId>;
pub type PropertySignals = BTreeMap<PropertyId, Vec<String>>;
pub type SignalProperties = BTreeMap<String, PropertyId>;
pub type SignalFrames = BTreeMap<String, String>;
pub type HeaderKinds = BTreeMap<PropertyId, ValueKind>;

/// The property lookups of one cache generation
#[derive(Debug, Clone)]
pub struct PropertyView {
    pub generation: u64,
    pub property_ids: Arc<SignalProperties>,
    pub signal_names_by_property: Arc<PropertySignals>,
    pub header_kinds: Arc<HeaderKinds>,
}

#[derive(Default)]
struct Slots {
    frame_ids: Option<Arc<FrameIdMap>>,
    signal_names_by_property: Option<Arc<PropertySignals>>,
    property_ids: Option<Arc<SignalProperties>>,
    matchers: HashMap<(PropertyId, ValueKind), Arc<PropertyMatcher>>,
    time_series: Option<Arc<SignalTimeSeries>>,
    signal_frames: Option<Arc<SignalFrames>>,
    header_kinds: Option<Arc<HeaderKinds>>,
}

struct CacheState {
    sources: Sources,
    generation: u64,
    slots: Slots,
}

/// Memoized lookups shared by the transmitter, poller and replay worker
pub struct CacheLayer {
    state: Mutex<CacheState>,
}

impl CacheLayer {
    /// Create an empty cache over the given sources
    pub fn new(sources: Sources) -> Self {
        Self {
            state: Mutex::new(CacheState {
                sources,
                generation: 0,
                slots: Slots::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Active sources
    pub fn sources(&self) -> Sources {
        self.lock().sources.clone()
    }

    /// Bumped whenever the caches are invalidated
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Clear every slot
    pub fn invalidate_all(&self) {
        let mut state = self.lock();
        state.generation += 1;
        state.slots = Slots::default();
        tracing::debug!("Caches invalidated (generation {})", state.generation);
    }

    /// Swap the active sources and clear every slot
    pub fn replace_sources(&self, sources: Sources) {
        let mut state = self.lock();
        state.sources = sources;
        state.generation += 1;
        state.slots = Slots::default();
        tracing::info!("Cache sources replaced (generation {})", state.generation);
    }

    fn get_or_compute<T>(
        &self,
        slot: fn(&mut Slots) -> &mut Option<Arc<T>>,
        compute: impl Fn(&Sources) -> Result<T>,
    ) -> Result<Arc<T>> {
        loop {
            let (sources, generation) = {
                let mut state = self.lock();
                if let Some(value) = slot(&mut state.slots).as_ref() {
                    return Ok(value.clone());
                }
                (state.sources.clone(), state.generation)
            };

            let value = Arc::new(compute(&sources)?);

            let mut state = self.lock();
            if state.generation == generation {
                return Ok(slot(&mut state.slots).get_or_insert(value).clone());
            }
            tracing::debug!("Sources changed while filling cache, recomputing");
        }
    }

    /// Frame name → CAN id
    pub fn frame_ids(&self) -> Result<Arc<FrameIdMap>> {
        self.get_or_compute(
            |s| &mut s.frame_ids,
            |sources| {
                let primary: FrameIdMap = sources
                    .catalog
                    .frames()
                    .into_iter()
                    .map(|frame| (frame.name, frame.id))
                    .collect();
                if !primary.is_empty() {
                    return Ok(primary);
                }

                tracing::debug!("Catalog has no frames, reading frame table from vector store");
                Ok(sources.store.read_frame_id_map().unwrap_or_else(|e| {
                    tracing::warn!("Failed to read frame table: {}", e);
                    FrameIdMap::new()
                }))
            },
        )
    }

    /// Property id → signal names sharing it
    pub fn signal_names_by_property(&self) -> Result<Arc<PropertySignals>> {
        self.get_or_compute(
            |s| &mut s.signal_names_by_property,
            |sources| {
                let primary = match sources.store.read_property_map() {
                    Ok(map) => invert(map),
                    Err(e) => {
                        tracing::warn!("Failed to read property row: {}", e);
                        PropertySignals::new()
                    }
                };
                if !primary.is_empty() {
                    return Ok(primary);
                }

                Ok(sources
                    .header
                    .as_ref()
                    .map(|header| invert(header.signals().clone()))
                    .unwrap_or_default())
            },
        )
    }

    /// Signal → property id for every catalog signal that has one
    pub fn property_ids(&self) -> Result<Arc<SignalProperties>> {
        self.get_or_compute(
            |s| &mut s.property_ids,
            |sources| {
                let signals = catalog_signals(sources.catalog.as_ref());
                if let Some(header) = sources.header.as_ref() {
                    let primary: SignalProperties = signals
                        .iter()
                        .filter_map(|signal| {
                            header.property_for(signal).map(|id| (signal.clone(), id.clone()))
                        })
                        .collect();
                    if !primary.is_empty() {
                        return Ok(primary);
                    }
                }

                tracing::debug!("Scanning vector store for property ids");
                let mut secondary = SignalProperties::new();
                for signal in &signals {
                    match sources.store.find_property_id(signal) {
                        Ok(Some(id)) => {
                            secondary.insert(signal.clone(), id);
                        }
                        Ok(None) => tracing::debug!("No property id found for {}", signal),
                        Err(e) => tracing::warn!("Property scan failed for {}: {}", signal, e),
                    }
                }
                Ok(secondary)
            },
        )
    }

    /// Property ids, fan-out and header kinds from one generation
    ///
    /// Retried until no invalidation lands between the first and last read.
    pub fn property_view(&self) -> Result<PropertyView> {
        loop {
            let generation = self.generation();
            let property_ids = self.property_ids()?;
            let signal_names_by_property = self.signal_names_by_property()?;
            let header_kinds = self.header_kinds()?;
            if self.generation() == generation {
                return Ok(PropertyView {
                    generation,
                    property_ids,
                    signal_names_by_property,
                    header_kinds,
                });
            }
            tracing::debug!("Sources changed while reading property view, retrying");
        }
    }

    /// Compiled dump matcher for a property and value kind
    pub fn matcher(&self, property: &PropertyId, kind: ValueKind) -> Result<Arc<PropertyMatcher>> {
        let key = (property.clone(), kind);
        let mut state = self.lock();
        if let Some(matcher) = state.slots.matchers.get(&key) {
            return Ok(matcher.clone());
        }
        let matcher = Arc::new(PropertyMatcher::new(property, kind)?);
        state.slots.matchers.insert(key, matcher.clone());
        Ok(matcher)
    }

    /// Scripted time series
    pub fn time_series(&self) -> Result<Arc<SignalTimeSeries>> {
        self.get_or_compute(
            |s| &mut s.time_series,
            |sources| sources.store.read_time_series(),
        )
    }

    /// Signal → owning frame name
    pub fn signal_frames(&self) -> Result<Arc<SignalFrames>> {
        self.get_or_compute(
            |s| &mut s.signal_frames,
            |sources| {
                let mut map = SignalFrames::new();
                for frame in sources.catalog.frames() {
                    for signal in &frame.signals {
                        map.entry(signal.name.clone())
                            .or_insert_with(|| frame.name.clone());
                    }
                }
                Ok(map)
            },
        )
    }

    /// Property id → declared kind from the header
    pub fn header_kinds(&self) -> Result<Arc<HeaderKinds>> {
        self.get_or_compute(
            |s| &mut s.header_kinds,
            |sources| {
                Ok(sources
                    .header
                    .as_ref()
                    .map(|header| header.kinds().clone())
                    .unwrap_or_default())
            },
        )
    }
}

fn catalog_signals(catalog: &dyn Catalog) -> BTreeSet<String> {
    catalog
        .frames()
        .into_iter()
        .flat_map(|frame| frame.signals.into_iter().map(|s| s.name))
        .collect()
}

fn invert(map: BTreeMap<String, PropertyId>) -> PropertySignals {
    let mut inverted = PropertySignals::new();
    for (signal, id) in map {
        inverted.entry(id).or_default().push(signal);
    }
    inverted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::catalog::{FrameDef, MockCatalog, SignalDef};
    use crate::backend::vector_store::MockVectorStore;
    use crate::error::CanAssureError;
    use crate::types::SignalSeries;

    fn frames() -> Vec<FrameDef> {
        vec![FrameDef::new("Body_Ctrl", CanId(0x200))
            .with_signal(SignalDef::new("Door_Lock", 0, 1))
            .with_signal(SignalDef::new("Window", 1, 1))]
    }

    fn catalog_with(frames: Vec<FrameDef>) -> Arc<dyn Catalog> {
        let mut catalog = MockCatalog::new();
        catalog.expect_frames().returning(move || frames.clone());
        Arc::new(catalog)
    }

    fn id(raw: &str) -> PropertyId {
        PropertyId::new(raw).unwrap()
    }

    #[test]
    fn test_frame_ids_prefer_catalog() {
        let mut store = MockVectorStore::new();
        store.expect_read_frame_id_map().never();
        let cache = CacheLayer::new(Sources::new(catalog_with(frames()), Arc::new(store)));

        let ids = cache.frame_ids().unwrap();
        assert_eq!(ids.get("Body_Ctrl"), Some(&CanId(0x200)));
    }

    #[test]
    fn test_frame_ids_fall_back_to_store() {
        let mut store = MockVectorStore::new();
        store.expect_read_frame_id_map().times(1).returning(|| {
            Ok([("Motor".to_string(), CanId(0x301))].into_iter().collect())
        });
        let cache = CacheLayer::new(Sources::new(catalog_with(Vec::new()), Arc::new(store)));

        assert_eq!(cache.frame_ids().unwrap().get("Motor"), Some(&CanId(0x301)));
        // Memoized: the store is read once
        assert_eq!(cache.frame_ids().unwrap().len(), 1);
    }

    #[test]
    fn test_signal_names_fan_out() {
        let mut store = MockVectorStore::new();
        store.expect_read_property_map().returning(|| {
            Ok([
                ("Door_Lock".to_string(), PropertyId::new("10").unwrap()),
                ("Door_Lock_Mirror".to_string(), PropertyId::new("10").unwrap()),
                ("Window".to_string(), PropertyId::new("11").unwrap()),
            ]
            .into_iter()
            .collect())
        });
        let cache = CacheLayer::new(Sources::new(catalog_with(frames()), Arc::new(store)));

        let map = cache.signal_names_by_property().unwrap();
        assert_eq!(map[&id("10")], vec!["Door_Lock", "Door_Lock_Mirror"]);
        assert_eq!(map[&id("11")], vec!["Window"]);
    }

    #[test]
    fn test_signal_names_fall_back_to_header() {
        let mut store = MockVectorStore::new();
        store
            .expect_read_property_map()
            .returning(|| Err(CanAssureError::VectorStore("locked".to_string())));
        let header = PropertyHeader::parse("Body_Ctrl__Door_Lock_RX_V = 16\n").unwrap();
        let sources = Sources::new(catalog_with(frames()), Arc::new(store)).with_header(header);
        let cache = CacheLayer::new(sources);

        let map = cache.signal_names_by_property().unwrap();
        assert_eq!(map[&id("10")], vec!["Door_Lock"]);
    }

    #[test]
    fn test_property_ids_prefer_header() {
        let mut store = MockVectorStore::new();
        store.expect_find_property_id().never();
        let header = PropertyHeader::parse(
            "Body_Ctrl__door_lock_RX_V = 16 /* VehiclePropertyType:INT32 */\n",
        )
        .unwrap();
        let sources = Sources::new(catalog_with(frames()), Arc::new(store)).with_header(header);
        let cache = CacheLayer::new(sources);

        let ids = cache.property_ids().unwrap();
        assert_eq!(ids.get("Door_Lock"), Some(&id("10")));
        assert!(!ids.contains_key("Window"));
        assert_eq!(cache.header_kinds().unwrap().get(&id("10")), Some(&ValueKind::Int32));
    }

    #[test]
    fn test_property_ids_scan_store_without_header() {
        let mut store = MockVectorStore::new();
        store
            .expect_find_property_id()
            .times(2)
            .returning(|signal| Ok((signal == "Window").then(|| PropertyId::new("11").unwrap())));
        let cache = CacheLayer::new(Sources::new(catalog_with(frames()), Arc::new(store)));

        let ids = cache.property_ids().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(ids.get("Window"), Some(&id("11")));
    }

    #[test]
    fn test_matcher_is_reused() {
        let cache = CacheLayer::new(Sources::new(
            catalog_with(Vec::new()),
            Arc::new(MockVectorStore::new()),
        ));
        let a = cache.matcher(&id("10"), ValueKind::Int32).unwrap();
        let b = cache.matcher(&id("10"), ValueKind::Int32).unwrap();
        let c = cache.matcher(&id("10"), ValueKind::Float).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_invalidate_all_forces_fresh_reads() {
        let mut store = MockVectorStore::new();
        let mut calls = 0.0;
        store.expect_read_time_series().times(2).returning(move || {
            calls += 1.0;
            let mut series = SignalTimeSeries::new();
            series.insert("Door_Lock".to_string(), SignalSeries::new().with_point(0, calls));
            Ok(series)
        });
        let cache = CacheLayer::new(Sources::new(catalog_with(frames()), Arc::new(store)));

        assert_eq!(cache.time_series().unwrap()["Door_Lock"].value_at(0), Some(1.0));
        assert_eq!(cache.time_series().unwrap()["Door_Lock"].value_at(0), Some(1.0));

        let before = cache.generation();
        cache.invalidate_all();
        assert_eq!(cache.generation(), before + 1);
        assert_eq!(cache.time_series().unwrap()["Door_Lock"].value_at(0), Some(2.0));
    }

    #[test]
    fn test_property_view_never_mixes_generations() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::OnceLock;

        let cache_slot: Arc<OnceLock<Arc<CacheLayer>>> = Arc::new(OnceLock::new());

        let mut fresh = MockVectorStore::new();
        fresh
            .expect_find_property_id()
            .returning(|signal| Ok((signal == "Door_Lock").then(|| PropertyId::new("20").unwrap())));
        fresh.expect_read_property_map().returning(|| {
            Ok([("Door_Lock".to_string(), PropertyId::new("20").unwrap())]
                .into_iter()
                .collect())
        });
        let replacement = Sources::new(catalog_with(frames()), Arc::new(fresh));

        // The stale store swaps the sources while its property row is read
        let mut stale = MockVectorStore::new();
        stale
            .expect_find_property_id()
            .returning(|signal| Ok((signal == "Door_Lock").then(|| PropertyId::new("10").unwrap())));
        let swapped = AtomicBool::new(false);
        let slot = cache_slot.clone();
        stale.expect_read_property_map().returning(move || {
            if !swapped.swap(true, Ordering::SeqCst) {
                if let Some(cache) = slot.get() {
                    cache.replace_sources(replacement.clone());
                }
            }
            Ok([("Door_Lock".to_string(), PropertyId::new("10").unwrap())]
                .into_iter()
                .collect())
        });

        let cache = Arc::new(CacheLayer::new(Sources::new(
            catalog_with(frames()),
            Arc::new(stale),
        )));
        cache_slot.set(cache.clone()).ok().unwrap();

        let view = cache.property_view().unwrap();
        assert_eq!(view.generation, 1);
        assert_eq!(view.property_ids.get("Door_Lock"), Some(&id("20")));
        assert_eq!(view.signal_names_by_property[&id("20")], vec!["Door_Lock"]);
        assert!(!view.signal_names_by_property.contains_key(&id("10")));
    }

    #[test]
    fn test_replace_sources_clears_every_slot() {
        let cache = CacheLayer::new(Sources::new(
            catalog_with(frames()),
            Arc::new(MockVectorStore::new()),
        ));
        assert!(cache.signal_frames().unwrap().contains_key("Door_Lock"));

        let other = vec![FrameDef::new("Motor", CanId(0x301)).with_signal(SignalDef::new("Rpm", 0, 16))];
        cache.replace_sources(Sources::new(catalog_with(other), Arc::new(MockVectorStore::new())));

        let frames = cache.signal_frames().unwrap();
        assert!(!frames.contains_key("Door_Lock"));
        assert_eq!(frames.get("Rpm").map(String::as_str), Some("Motor"));
        assert_eq!(cache.frame_ids().unwrap().get("Motor"), Some(&CanId(0x301)));
    }
}
