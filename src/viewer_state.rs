// =============================================================================
// ViewerState builder (C8)
// =============================================================================
//
// Pure, stateless per call; uses an injected per-symbol cache. Ported from
// spec §4.8 and `viewer_state_builder.py`'s newborn-suppression/zone-merge/
// pool-hidden-TTL trio, expressed against a generalised Zone/Pool shape
// rather than the engine's full hint schema (which is out of scope, per
// spec §1 — the engine is an opaque collaborator).
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const MAX_EVENTS: usize = 20;
pub const MAX_LEGS: usize = 6;
pub const MAX_SWINGS: usize = 6;
pub const MAX_RANGES: usize = 5;
pub const MAX_OTE_ZONES: usize = 6;
pub const MAX_POOLS: usize = 8;
pub const MAX_EXECUTION_EVENTS: usize = 12;
pub const MIN_CLOSE_STEPS_ZONES: u64 = 1;
pub const MIN_CLOSE_STEPS_POOLS: u64 = 2;
pub const POOL_HIDDEN_TTL_CLOSE_STEPS: u64 = 2;
pub const VIEWER_STATE_SCHEMA_VERSION: u32 = 1;
pub const ZONE_MERGE_IOU_THRESHOLD: f64 = 0.4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRaw {
    pub zone_id: Option<String>,
    pub zone_type: String,
    pub direction: String,
    pub role: String,
    pub tf: String,
    pub min: f64,
    pub max: f64,
}

impl ZoneRaw {
    fn key(&self) -> String {
        self.zone_id.clone().unwrap_or_else(|| {
            format!(
                "{}|{}|{}|{}|{:.5}|{:.5}",
                self.zone_type, self.direction, self.role, self.tf, self.min, self.max
            )
        })
    }

    fn group_key(&self) -> String {
        format!("{}|{}|{}|{}", self.zone_type, self.direction, self.role, self.tf)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneShown {
    pub zone_type: String,
    pub direction: String,
    pub role: String,
    pub tf: String,
    pub min: f64,
    pub max: f64,
    pub stack: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZonesMeta {
    pub truth_count: usize,
    pub shown_count: usize,
    pub merged_clusters_count: usize,
    pub merged_away_count: usize,
    pub max_stack: usize,
    pub filtered_missing_bounds_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRaw {
    pub cluster_id: Option<String>,
    pub liq_type: String,
    pub role: String,
    pub side: String,
    pub level: f64,
    pub strength: f64,
    pub n_touches: u32,
    /// Whether the engine reported a touch on this pool this cycle —
    /// drives `touched_while_hidden_count` for hidden entries.
    pub touched_this_cycle: bool,
}

impl PoolRaw {
    fn key(&self) -> String {
        self.cluster_id.clone().unwrap_or_else(|| {
            format!("{}|{}|{}|{:.5}", self.liq_type, self.role, self.side, self.level)
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolsMeta {
    pub truth_count: usize,
    pub shown_count: usize,
    pub hidden_count: usize,
    pub hidden_reasons: HashMap<String, usize>,
    pub touched_while_hidden_count: usize,
    pub touched_while_hidden_reasons: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
struct HiddenPool {
    pool: PoolRaw,
    hidden_since_step: u64,
    reason: &'static str,
}

/// Per-symbol cache, advances only on `compute_kind=close` messages.
#[derive(Debug, Clone, Default)]
pub struct ViewerStateCache {
    pub close_step: u64,
    born_step_by_zone_key: HashMap<String, u64>,
    born_step_by_pool_key: HashMap<String, u64>,
    hidden_pools: HashMap<String, HiddenPool>,
    last_events: Vec<String>,
    last_zones_raw: Vec<ZoneRaw>,
    last_fxcm_meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct AssetHint {
    pub compute_kind: String, // "close" | "preview"
    pub events: Vec<String>,
    pub zones: Vec<ZoneRaw>,
    pub pools: Vec<PoolRaw>,
    pub execution_events: Vec<String>,
    pub fxcm_meta: Option<serde_json::Value>,
    pub fxcm_block: Option<serde_json::Value>,
    pub pipeline_state: String,
    pub ready_bars: i64,
    pub required_bars: i64,
    pub required_bars_min: i64,
    pub structure: Option<serde_json::Value>,
    pub scenario: Option<serde_json::Value>,
    pub meta: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineLocal {
    pub state: String,
    pub ready_bars: i64,
    pub required_bars: i64,
    pub required_bars_min: i64,
    pub ready_ratio: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ViewerState {
    pub schema: u32,
    pub events: Vec<String>,
    pub zones: Vec<ZoneShown>,
    pub zones_meta: ZonesMeta,
    pub pools: Vec<PoolRaw>,
    pub pools_meta: PoolsMeta,
    pub execution: Vec<String>,
    pub fxcm: Option<serde_json::Value>,
    pub pipeline_local: PipelineLocal,
    pub structure: Option<serde_json::Value>,
    pub scenario: Option<serde_json::Value>,
    pub meta: Option<serde_json::Value>,
}

fn iou(a: (f64, f64), b: (f64, f64)) -> f64 {
    let inter = (a.1.min(b.1) - a.0.max(b.0)).max(0.0);
    let union = a.1.max(b.1) - a.0.min(b.0);
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Merge zones within a `(type, direction, role, tf)` group whose intervals
/// overlap with IoU >= threshold, per spec §4.8 step 5.
fn merge_zones(zones: &[ZoneRaw]) -> (Vec<ZoneShown>, usize, usize) {
    let mut groups: HashMap<String, Vec<&ZoneRaw>> = HashMap::new();
    for z in zones {
        groups.entry(z.group_key()).or_default().push(z);
    }

    let mut shown = Vec::new();
    let mut merged_clusters_count = 0;
    let mut merged_away_count = 0;

    for (_key, mut members) in groups {
        members.sort_by(|a, b| a.min.partial_cmp(&b.min).unwrap());
        let mut clusters: Vec<Vec<&ZoneRaw>> = Vec::new();
        for z in members {
            let mut placed = false;
            for cluster in clusters.iter_mut() {
                let band = cluster_bounds(cluster);
                if iou((z.min, z.max), band) >= ZONE_MERGE_IOU_THRESHOLD {
                    cluster.push(z);
                    placed = true;
                    break;
                }
            }
            if !placed {
                clusters.push(vec![z]);
            }
        }

        for cluster in clusters {
            let (min, max) = cluster_bounds(&cluster);
            let stack = cluster.len();
            if stack > 1 {
                merged_clusters_count += 1;
                merged_away_count += stack - 1;
            }
            let first = cluster[0];
            shown.push(ZoneShown {
                zone_type: first.zone_type.clone(),
                direction: first.direction.clone(),
                role: first.role.clone(),
                tf: first.tf.clone(),
                min,
                max,
                stack,
            });
        }
    }

    (shown, merged_clusters_count, merged_away_count)
}

/// Caps the `legs`/`swings`/`ranges`/`ote_zones` arrays inside the engine's
/// opaque `structure` block at the spec's size bounds. The block's own
/// schema belongs to the engine (out of scope per spec §1); this only trims
/// known array keys when present and leaves the rest of the value untouched.
fn truncate_structure(mut structure: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = structure.as_object_mut() {
        truncate_array_field(obj, "legs", MAX_LEGS);
        truncate_array_field(obj, "swings", MAX_SWINGS);
        truncate_array_field(obj, "ranges", MAX_RANGES);
        truncate_array_field(obj, "ote_zones", MAX_OTE_ZONES);
    }
    structure
}

fn truncate_array_field(obj: &mut serde_json::Map<String, serde_json::Value>, key: &str, max: usize) {
    if let Some(arr) = obj.get_mut(key).and_then(|v| v.as_array_mut()) {
        if arr.len() > max {
            arr.truncate(max);
        }
    }
}

fn cluster_bounds(cluster: &[&ZoneRaw]) -> (f64, f64) {
    let min = cluster.iter().map(|z| z.min).fold(f64::INFINITY, f64::min);
    let max = cluster
        .iter()
        .map(|z| z.max)
        .fold(f64::NEG_INFINITY, f64::max);
    (min, max)
}

/// Build the ViewerState for one symbol. `close_step_before` is the cache's
/// `close_step` prior to this call's possible advance.
pub fn build_viewer_state(hint: AssetHint, cache: &mut ViewerStateCache) -> ViewerState {
    let is_preview = hint.compute_kind.eq_ignore_ascii_case("preview");
    if !is_preview {
        cache.close_step += 1;
    }
    let close_step = cache.close_step;

    // --- zones: newborn suppression + merge -------------------------------
    let truth_zone_count = hint.zones.len();
    let filtered_missing_bounds_count = hint
        .zones
        .iter()
        .filter(|z| !z.min.is_finite() || !z.max.is_finite())
        .count();

    let mut eligible_zones = Vec::new();
    for z in &hint.zones {
        if !z.min.is_finite() || !z.max.is_finite() {
            continue;
        }
        let key = z.key();
        if !is_preview {
            cache.born_step_by_zone_key.entry(key.clone()).or_insert(close_step);
        }
        let born = cache.born_step_by_zone_key.get(&key).copied();
        if let Some(born) = born {
            if close_step - born >= MIN_CLOSE_STEPS_ZONES {
                eligible_zones.push(z.clone());
            }
        }
    }

    let (zones_shown, merged_clusters_count, merged_away_count) = merge_zones(&eligible_zones);

    let zones_to_use = if hint.zones.is_empty() && !cache.last_zones_raw.is_empty() {
        cache.last_zones_raw.clone()
    } else {
        hint.zones.clone()
    };
    if !hint.zones.is_empty() {
        cache.last_zones_raw = hint.zones.clone();
    }
    let _ = &zones_to_use; // raw backfill retained for potential future surface; shown list below is canonical.

    let zones_meta = ZonesMeta {
        truth_count: truth_zone_count,
        shown_count: zones_shown.len(),
        merged_clusters_count,
        merged_away_count,
        max_stack: zones_shown.iter().map(|z| z.stack).max().unwrap_or(0),
        filtered_missing_bounds_count,
    };

    // --- pools: newborn suppression + top-K + hidden-TTL --------------------
    let truth_pool_count = hint.pools.len();
    let mut sorted_pools = hint.pools.clone();
    sorted_pools.sort_by(|a, b| {
        b.strength
            .partial_cmp(&a.strength)
            .unwrap()
            .then(b.n_touches.cmp(&a.n_touches))
            .then(a.key().cmp(&b.key()))
    });

    let mut eligible_pools = Vec::new();
    for p in &sorted_pools {
        let key = p.key();
        if !is_preview {
            cache.born_step_by_pool_key.entry(key.clone()).or_insert(close_step);
        }
        if let Some(born) = cache.born_step_by_pool_key.get(&key).copied() {
            if close_step - born >= MIN_CLOSE_STEPS_POOLS {
                eligible_pools.push(p.clone());
            }
        }
    }

    let shown_pools: Vec<PoolRaw> = eligible_pools.into_iter().take(MAX_POOLS).collect();
    let shown_keys: std::collections::HashSet<String> =
        shown_pools.iter().map(|p| p.key()).collect();

    let mut hidden_reasons: HashMap<String, usize> = HashMap::new();
    let mut touched_while_hidden_count = 0usize;
    let mut touched_while_hidden_reasons: HashMap<String, usize> = HashMap::new();

    // Entities previously shown that fell out of top-K become hidden with a
    // bounded TTL.
    let truth_keys: HashMap<String, &PoolRaw> =
        sorted_pools.iter().map(|p| (p.key(), p)).collect();
    for (key, truth) in &truth_keys {
        if shown_keys.contains(key) {
            cache.hidden_pools.remove(key);
            continue;
        }
        let entry = cache.hidden_pools.entry(key.clone()).or_insert_with(|| HiddenPool {
            pool: (*truth).clone(),
            hidden_since_step: close_step,
            reason: "evicted_cap",
        });
        entry.pool = (*truth).clone();
        if truth.touched_this_cycle {
            touched_while_hidden_count += 1;
            *touched_while_hidden_reasons
                .entry(entry.reason.to_string())
                .or_insert(0) += 1;
        }
    }
    cache
        .hidden_pools
        .retain(|_, h| close_step - h.hidden_since_step <= POOL_HIDDEN_TTL_CLOSE_STEPS);
    for h in cache.hidden_pools.values() {
        *hidden_reasons.entry(h.reason.to_string()).or_insert(0) += 1;
    }

    let pools_meta = PoolsMeta {
        truth_count: truth_pool_count,
        shown_count: shown_pools.len(),
        hidden_count: cache.hidden_pools.len(),
        hidden_reasons,
        touched_while_hidden_count,
        touched_while_hidden_reasons,
    };

    // --- backfill stability for events / fxcm meta --------------------------
    let events = if hint.events.is_empty() && !cache.last_events.is_empty() {
        cache.last_events.clone()
    } else {
        cache.last_events = hint.events.clone();
        hint.events.clone()
    };
    let events: Vec<String> = events.into_iter().take(MAX_EVENTS).collect();

    let fxcm = hint.fxcm_block.clone().or_else(|| hint.fxcm_meta.clone()).or_else(|| {
        cache.last_fxcm_meta.clone()
    });
    if fxcm.is_some() {
        cache.last_fxcm_meta = fxcm.clone();
    }

    let execution: Vec<String> = hint
        .execution_events
        .into_iter()
        .take(MAX_EXECUTION_EVENTS)
        .collect();

    let ready_ratio = if hint.required_bars > 0 {
        (hint.ready_bars as f64 / hint.required_bars as f64).min(1.0)
    } else {
        0.0
    };

    ViewerState {
        schema: VIEWER_STATE_SCHEMA_VERSION,
        events,
        zones: zones_shown,
        zones_meta,
        pools: shown_pools,
        pools_meta,
        execution,
        fxcm,
        pipeline_local: PipelineLocal {
            state: hint.pipeline_state,
            ready_bars: hint.ready_bars,
            required_bars: hint.required_bars,
            required_bars_min: hint.required_bars_min,
            ready_ratio,
        },
        structure: hint.structure.map(truncate_structure),
        scenario: hint.scenario,
        meta: hint.meta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_hint() -> AssetHint {
        AssetHint {
            compute_kind: "close".to_string(),
            events: vec![],
            zones: vec![],
            pools: vec![],
            execution_events: vec![],
            fxcm_meta: None,
            fxcm_block: None,
            pipeline_state: "LIVE".to_string(),
            ready_bars: 300,
            required_bars: 300,
            required_bars_min: 100,
            structure: None,
            scenario: None,
            meta: None,
        }
    }

    fn pool(cluster_id: &str, strength: f64, touched: bool) -> PoolRaw {
        PoolRaw {
            cluster_id: Some(cluster_id.to_string()),
            liq_type: "WICK_CLUSTER".to_string(),
            role: "support".to_string(),
            side: "buy".to_string(),
            level: 100.0,
            strength,
            n_touches: 1,
            touched_this_cycle: touched,
        }
    }

    #[test]
    fn newborn_pool_hidden_until_min_close_steps() {
        let mut cache = ViewerStateCache::default();
        let mut hint = base_hint();
        hint.pools = vec![pool("abc", 1.0, false)];

        let state_n = build_viewer_state(hint.clone(), &mut cache);
        assert_eq!(state_n.pools_meta.truth_count, 1);
        assert_eq!(state_n.pools_meta.shown_count, 0);

        let state_n1 = build_viewer_state(hint.clone(), &mut cache);
        assert_eq!(state_n1.pools_meta.shown_count, 0);

        let state_n2 = build_viewer_state(hint, &mut cache);
        assert_eq!(state_n2.pools_meta.shown_count, 1);
    }

    #[test]
    fn preview_never_promotes_to_born() {
        let mut cache = ViewerStateCache::default();
        let mut hint = base_hint();
        hint.compute_kind = "preview".to_string();
        hint.pools = vec![pool("abc", 1.0, false)];

        for _ in 0..10 {
            let state = build_viewer_state(hint.clone(), &mut cache);
            assert_eq!(state.pools_meta.shown_count, 0);
        }
    }

    #[test]
    fn zone_merge_groups_overlapping_intervals() {
        let mut cache = ViewerStateCache::default();
        let mut hint = base_hint();
        hint.zones = vec![
            ZoneRaw {
                zone_id: Some("z1".to_string()),
                zone_type: "OB".to_string(),
                direction: "bull".to_string(),
                role: "demand".to_string(),
                tf: "5m".to_string(),
                min: 100.0,
                max: 110.0,
            },
            ZoneRaw {
                zone_id: Some("z2".to_string()),
                zone_type: "OB".to_string(),
                direction: "bull".to_string(),
                role: "demand".to_string(),
                tf: "5m".to_string(),
                min: 101.0,
                max: 111.0,
            },
        ];
        // born at step 1; need step-1 >= 1 to show -> call twice.
        build_viewer_state(hint.clone(), &mut cache);
        let state = build_viewer_state(hint, &mut cache);
        assert_eq!(state.zones.len(), 1);
        assert_eq!(state.zones[0].stack, 2);
        assert_eq!(state.zones_meta.merged_clusters_count, 1);
        assert_eq!(state.zones_meta.merged_away_count, 1);
    }

    #[test]
    fn structure_arrays_truncated_to_size_bounds() {
        let mut cache = ViewerStateCache::default();
        let mut hint = base_hint();
        hint.structure = Some(serde_json::json!({
            "legs": [1, 2, 3, 4, 5, 6, 7, 8],
            "swings": [1, 2, 3, 4, 5, 6, 7],
            "ranges": [1, 2, 3, 4, 5, 6],
            "ote_zones": [1, 2, 3, 4, 5, 6, 7],
            "other": "unrelated",
        }));

        let state = build_viewer_state(hint, &mut cache);
        let structure = state.structure.unwrap();
        assert_eq!(structure["legs"].as_array().unwrap().len(), MAX_LEGS);
        assert_eq!(structure["swings"].as_array().unwrap().len(), MAX_SWINGS);
        assert_eq!(structure["ranges"].as_array().unwrap().len(), MAX_RANGES);
        assert_eq!(structure["ote_zones"].as_array().unwrap().len(), MAX_OTE_ZONES);
        assert_eq!(structure["other"], "unrelated");
    }

    #[test]
    fn backfill_stability_reuses_cached_events_when_new_list_empty() {
        let mut cache = ViewerStateCache::default();
        let mut hint = base_hint();
        hint.events = vec!["BOS_UP".to_string()];
        build_viewer_state(hint, &mut cache);

        let empty_hint = base_hint();
        let state = build_viewer_state(empty_hint, &mut cache);
        assert_eq!(state.events, vec!["BOS_UP".to_string()]);
    }
}
