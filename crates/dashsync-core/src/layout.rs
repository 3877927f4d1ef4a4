// ── Dashboard layout store ──
//
// Single source of truth for the widget grid. All mutation goes through
// `LayoutStore`; consumers receive read-only snapshots over a watch
// channel, so a drag handler and a settings panel can never hold
// divergent copies of the layout.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use crate::error::CoreError;
use crate::persist::{self, StorageBackend};
use crate::stream::StateStream;

/// Key under which the layout is persisted.
const LAYOUT_KEY: &str = "dashsync:layout";

// ── Grid model ──────────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WidgetSize {
    Small,
    Medium,
    Large,
    Full,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Breakpoint {
    Mobile,
    Tablet,
    Desktop,
}

impl Breakpoint {
    /// Grid columns available at this breakpoint.
    pub fn columns(self) -> u32 {
        match self {
            Self::Mobile => 4,
            Self::Tablet => 8,
            Self::Desktop => 12,
        }
    }
}

/// Span table: size class to `(width, height)` in grid cells.
fn dimensions(size: WidgetSize, breakpoint: Breakpoint) -> (u32, u32) {
    match breakpoint {
        Breakpoint::Desktop => match size {
            WidgetSize::Small => (3, 2),
            WidgetSize::Medium => (6, 3),
            WidgetSize::Large => (8, 4),
            WidgetSize::Full => (12, 4),
        },
        Breakpoint::Tablet => match size {
            WidgetSize::Small => (4, 2),
            WidgetSize::Medium => (4, 3),
            WidgetSize::Large => (8, 4),
            WidgetSize::Full => (8, 4),
        },
        // Everything is single-column width on phones.
        Breakpoint::Mobile => match size {
            WidgetSize::Small => (4, 2),
            WidgetSize::Medium => (4, 3),
            WidgetSize::Large => (4, 4),
            WidgetSize::Full => (4, 4),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetPosition {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub id: Uuid,
    pub kind: String,
    pub title: String,
    pub size: WidgetSize,
    pub position: WidgetPosition,
    pub visible: bool,
    pub locked: bool,
    pub config: Value,
}

// ── Catalog ─────────────────────────────────────────────────────────

/// Catalog entry a widget is instantiated from.
#[derive(Debug, Clone)]
pub struct WidgetTemplate {
    pub kind: &'static str,
    pub title: &'static str,
    pub default_size: WidgetSize,
    pub default_config: fn() -> Value,
}

fn empty_config() -> Value {
    Value::Object(serde_json::Map::new())
}

fn chart_config() -> Value {
    serde_json::json!({ "range": "30d", "granularity": "day" })
}

fn table_config() -> Value {
    serde_json::json!({ "page_size": 10 })
}

/// Built-in widget catalog.
pub fn catalog() -> &'static [WidgetTemplate] {
    &[
        WidgetTemplate {
            kind: "quick-stats",
            title: "Quick Stats",
            default_size: WidgetSize::Full,
            default_config: empty_config,
        },
        WidgetTemplate {
            kind: "revenue-chart",
            title: "Revenue",
            default_size: WidgetSize::Large,
            default_config: chart_config,
        },
        WidgetTemplate {
            kind: "orders-table",
            title: "Recent Orders",
            default_size: WidgetSize::Medium,
            default_config: table_config,
        },
        WidgetTemplate {
            kind: "top-products",
            title: "Top Products",
            default_size: WidgetSize::Medium,
            default_config: table_config,
        },
        WidgetTemplate {
            kind: "inventory-alerts",
            title: "Inventory Alerts",
            default_size: WidgetSize::Small,
            default_config: empty_config,
        },
        WidgetTemplate {
            kind: "conversion-rate",
            title: "Conversion Rate",
            default_size: WidgetSize::Medium,
            default_config: chart_config,
        },
        WidgetTemplate {
            kind: "customer-activity",
            title: "Customer Activity",
            default_size: WidgetSize::Large,
            default_config: empty_config,
        },
    ]
}

fn template(kind: &str) -> Option<&'static WidgetTemplate> {
    catalog().iter().find(|t| t.kind == kind)
}

/// Built-in presets: `(kind, size)` in display order.
fn preset(id: &str) -> Option<&'static [(&'static str, WidgetSize)]> {
    match id {
        "default" => Some(&[
            ("quick-stats", WidgetSize::Full),
            ("revenue-chart", WidgetSize::Large),
            ("orders-table", WidgetSize::Medium),
            ("top-products", WidgetSize::Medium),
            ("inventory-alerts", WidgetSize::Small),
        ]),
        "compact" => Some(&[
            ("quick-stats", WidgetSize::Small),
            ("revenue-chart", WidgetSize::Small),
            ("orders-table", WidgetSize::Small),
            ("inventory-alerts", WidgetSize::Small),
        ]),
        "analytics" => Some(&[
            ("revenue-chart", WidgetSize::Full),
            ("conversion-rate", WidgetSize::Medium),
            ("top-products", WidgetSize::Medium),
            ("customer-activity", WidgetSize::Large),
        ]),
        _ => None,
    }
}

// ── Snapshot ────────────────────────────────────────────────────────

/// Read-only view of the layout published to consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayoutSnapshot {
    pub widgets: Vec<Widget>,
    pub has_unsaved_changes: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Persisted form.
#[derive(Serialize, Deserialize)]
struct StoredLayout {
    widgets: Vec<Widget>,
    #[serde(default)]
    overrides: HashMap<Uuid, HashMap<Breakpoint, WidgetPosition>>,
    updated_at: Option<DateTime<Utc>>,
}

// ── LayoutStore ─────────────────────────────────────────────────────

/// Owner of the widget grid. Mutations take `&mut self`; observers use
/// [`LayoutStore::state`] or [`LayoutStore::subscribe`].
pub struct LayoutStore {
    widgets: Vec<Widget>,
    overrides: HashMap<Uuid, HashMap<Breakpoint, WidgetPosition>>,
    backend: Arc<dyn StorageBackend>,
    has_unsaved_changes: bool,
    updated_at: Option<DateTime<Utc>>,
    snapshot: watch::Sender<LayoutSnapshot>,
}

impl LayoutStore {
    /// Create a store with the built-in default layout.
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let widgets = default_widgets();
        let (snapshot, _) = watch::channel(LayoutSnapshot {
            widgets: widgets.clone(),
            has_unsaved_changes: false,
            updated_at: None,
        });
        Self {
            widgets,
            overrides: HashMap::new(),
            backend,
            has_unsaved_changes: false,
            updated_at: None,
            snapshot,
        }
    }

    /// Restore a saved layout, falling back to the built-in default
    /// when nothing has been persisted yet.
    pub fn load(backend: Arc<dyn StorageBackend>) -> Result<Self, CoreError> {
        let mut store = Self::new(backend);

        if let Some(raw) = store.backend.read(LAYOUT_KEY)? {
            let stored: StoredLayout = persist::decode(&raw)?;
            debug!(widgets = stored.widgets.len(), "restored saved layout");
            store.widgets = stored.widgets;
            store.overrides = stored.overrides;
            store.updated_at = stored.updated_at;
            store.publish();
        }

        Ok(store)
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// Instantiate a catalog widget. Without an explicit position the
    /// widget is appended and rows are recomputed.
    pub fn add_widget(
        &mut self,
        kind: &str,
        position: Option<WidgetPosition>,
    ) -> Result<Uuid, CoreError> {
        let template = template(kind).ok_or_else(|| CoreError::UnknownWidgetKind {
            kind: kind.to_string(),
        })?;

        let id = Uuid::new_v4();
        let (width, height) = dimensions(template.default_size, Breakpoint::Desktop);
        self.widgets.push(Widget {
            id,
            kind: template.kind.to_string(),
            title: template.title.to_string(),
            size: template.default_size,
            position: position.unwrap_or(WidgetPosition {
                x: 0,
                y: 0,
                width,
                height,
            }),
            visible: true,
            locked: false,
            config: (template.default_config)(),
        });

        if position.is_none() {
            recompute_rows(&mut self.widgets);
        }
        self.touch();
        Ok(id)
    }

    pub fn remove_widget(&mut self, id: Uuid) -> Result<(), CoreError> {
        let index = self.index_of(id)?;
        self.widgets.remove(index);
        self.overrides.remove(&id);
        recompute_rows(&mut self.widgets);
        self.touch();
        Ok(())
    }

    /// Place a widget at an explicit position. Locked widgets refuse.
    pub fn move_widget(&mut self, id: Uuid, position: WidgetPosition) -> Result<(), CoreError> {
        let index = self.index_of(id)?;
        let widget = &mut self.widgets[index];
        if widget.locked {
            return Err(CoreError::invalid(format!("widget {id} is locked")));
        }
        widget.position = position;
        self.touch();
        Ok(())
    }

    /// Change a widget's size class; its span is re-read from the
    /// desktop table and rows are recomputed.
    pub fn resize_widget(&mut self, id: Uuid, size: WidgetSize) -> Result<(), CoreError> {
        let index = self.index_of(id)?;
        let widget = &mut self.widgets[index];
        if widget.locked {
            return Err(CoreError::invalid(format!("widget {id} is locked")));
        }
        widget.size = size;
        let (width, height) = dimensions(size, Breakpoint::Desktop);
        widget.position.width = width;
        widget.position.height = height;
        recompute_rows(&mut self.widgets);
        self.touch();
        Ok(())
    }

    pub fn set_visible(&mut self, id: Uuid, visible: bool) -> Result<(), CoreError> {
        let index = self.index_of(id)?;
        self.widgets[index].visible = visible;
        self.touch();
        Ok(())
    }

    pub fn set_locked(&mut self, id: Uuid, locked: bool) -> Result<(), CoreError> {
        let index = self.index_of(id)?;
        self.widgets[index].locked = locked;
        self.touch();
        Ok(())
    }

    /// Move the widget at `from` to `to`, then recompute every row.
    pub fn reorder_widgets(&mut self, from: usize, to: usize) -> Result<(), CoreError> {
        let len = self.widgets.len();
        if from >= len || to >= len {
            return Err(CoreError::invalid(format!(
                "reorder index out of bounds ({from} -> {to}, len {len})"
            )));
        }
        let widget = self.widgets.remove(from);
        self.widgets.insert(to, widget);
        recompute_rows(&mut self.widgets);
        self.touch();
        Ok(())
    }

    /// Apply a full ordering. `ids` must be a permutation of the
    /// current id set.
    pub fn apply_order(&mut self, ids: &[Uuid]) -> Result<(), CoreError> {
        if ids.len() != self.widgets.len() {
            return Err(CoreError::invalid("ordering must cover every widget"));
        }

        let mut reordered = Vec::with_capacity(ids.len());
        for id in ids {
            let index = self
                .widgets
                .iter()
                .position(|w| w.id == *id)
                .ok_or_else(|| CoreError::WidgetNotFound { id: id.to_string() })?;
            reordered.push(self.widgets.remove(index));
        }

        self.widgets = reordered;
        recompute_rows(&mut self.widgets);
        self.touch();
        Ok(())
    }

    /// Replace the layout with a built-in preset.
    pub fn apply_preset(&mut self, id: &str) -> Result<(), CoreError> {
        let entries = preset(id).ok_or_else(|| CoreError::PresetNotFound { id: id.to_string() })?;

        self.widgets = build_widgets(entries);
        self.overrides.clear();
        self.touch();
        Ok(())
    }

    /// Save a per-breakpoint position override for one widget. The
    /// override wins outright during responsive resolution.
    pub fn set_override(
        &mut self,
        id: Uuid,
        breakpoint: Breakpoint,
        position: WidgetPosition,
    ) -> Result<(), CoreError> {
        self.index_of(id)?;
        self.overrides.entry(id).or_default().insert(breakpoint, position);
        self.touch();
        Ok(())
    }

    pub fn clear_override(&mut self, id: Uuid, breakpoint: Breakpoint) {
        if let Some(per_widget) = self.overrides.get_mut(&id) {
            per_widget.remove(&breakpoint);
            if per_widget.is_empty() {
                self.overrides.remove(&id);
            }
        }
        self.touch();
    }

    /// Persist the layout, stamp `updated_at`, and clear the dirty
    /// flag. Storage failures surface to the caller.
    pub fn save_layout(&mut self) -> Result<(), CoreError> {
        let stored = StoredLayout {
            widgets: self.widgets.clone(),
            overrides: self.overrides.clone(),
            updated_at: Some(Utc::now()),
        };
        let raw = persist::encode(&stored)?;
        self.backend.write(LAYOUT_KEY, &raw)?;

        self.updated_at = stored.updated_at;
        self.has_unsaved_changes = false;
        self.publish();
        Ok(())
    }

    /// Restore the built-in default layout in memory. Nothing is
    /// persisted until the next `save_layout`.
    pub fn reset_layout(&mut self) {
        self.widgets = default_widgets();
        self.overrides.clear();
        self.touch();
    }

    // ── Observation ──────────────────────────────────────────────────

    /// Resolve the layout for a breakpoint: visible widgets flowed
    /// across the breakpoint's grid, with saved overrides winning
    /// outright.
    pub fn responsive_widgets(&self, breakpoint: Breakpoint) -> Vec<Widget> {
        let columns = breakpoint.columns();
        let mut cursor_x = 0u32;
        let mut cursor_y = 0u32;
        let mut row_height = 0u32;

        self.widgets
            .iter()
            .filter(|w| w.visible)
            .map(|w| {
                let mut resolved = w.clone();

                if let Some(position) = self
                    .overrides
                    .get(&w.id)
                    .and_then(|per_widget| per_widget.get(&breakpoint))
                {
                    resolved.position = *position;
                    return resolved;
                }

                let (width, height) = dimensions(w.size, breakpoint);
                if cursor_x + width > columns {
                    cursor_x = 0;
                    cursor_y += row_height;
                    row_height = 0;
                }
                resolved.position = WidgetPosition {
                    x: cursor_x,
                    y: cursor_y,
                    width,
                    height,
                };
                cursor_x += width;
                row_height = row_height.max(height);
                resolved
            })
            .collect()
    }

    pub fn widgets(&self) -> &[Widget] {
        &self.widgets
    }

    pub fn widget(&self, id: Uuid) -> Option<&Widget> {
        self.widgets.iter().find(|w| w.id == id)
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.has_unsaved_changes
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn state(&self) -> StateStream<LayoutSnapshot> {
        StateStream::new(self.snapshot.subscribe())
    }

    pub fn subscribe(&self) -> watch::Receiver<LayoutSnapshot> {
        self.snapshot.subscribe()
    }

    // ── Internals ────────────────────────────────────────────────────

    fn index_of(&self, id: Uuid) -> Result<usize, CoreError> {
        self.widgets
            .iter()
            .position(|w| w.id == id)
            .ok_or_else(|| CoreError::WidgetNotFound { id: id.to_string() })
    }

    fn touch(&mut self) {
        self.has_unsaved_changes = true;
        self.publish();
    }

    fn publish(&self) {
        let _ = self.snapshot.send(LayoutSnapshot {
            widgets: self.widgets.clone(),
            has_unsaved_changes: self.has_unsaved_changes,
            updated_at: self.updated_at,
        });
    }
}

/// Reassign every row from display order: `y = index / per_row` where
/// `per_row` is how many items of that width fit a desktop row.
/// Wholesale recomputation, so a reorder can never leave overlap or gap
/// artifacts behind.
fn recompute_rows(widgets: &mut [Widget]) {
    let columns = Breakpoint::Desktop.columns();
    for (index, widget) in widgets.iter_mut().enumerate() {
        let per_row = (columns / widget.position.width.max(1)).max(1);
        let index = index as u32;
        widget.position.y = index / per_row;
        widget.position.x = (index % per_row) * widget.position.width;
    }
}

fn build_widgets(entries: &[(&str, WidgetSize)]) -> Vec<Widget> {
    let mut widgets: Vec<Widget> = entries
        .iter()
        .filter_map(|&(kind, size)| {
            let template = template(kind)?;
            let (width, height) = dimensions(size, Breakpoint::Desktop);
            Some(Widget {
                id: Uuid::new_v4(),
                kind: template.kind.to_string(),
                title: template.title.to_string(),
                size,
                position: WidgetPosition {
                    x: 0,
                    y: 0,
                    width,
                    height,
                },
                visible: true,
                locked: false,
                config: (template.default_config)(),
            })
        })
        .collect();
    recompute_rows(&mut widgets);
    widgets
}

fn default_widgets() -> Vec<Widget> {
    preset("default").map(build_widgets).unwrap_or_default()
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::persist::MemoryBackend;
    use pretty_assertions::{assert_eq, assert_ne};
    use std::collections::HashSet;

    fn store() -> LayoutStore {
        LayoutStore::new(Arc::new(MemoryBackend::new()))
    }

    #[test]
    fn reorder_preserves_the_id_set_and_recomputes_rows() {
        let mut store = store();
        let before: HashSet<Uuid> = store.widgets().iter().map(|w| w.id).collect();
        let moved = store.widgets()[0].id;

        store.reorder_widgets(0, 3).unwrap();

        let after: HashSet<Uuid> = store.widgets().iter().map(|w| w.id).collect();
        assert_eq!(before, after);
        assert_eq!(store.widgets()[3].id, moved);

        // Rows follow display order exactly.
        for (index, widget) in store.widgets().iter().enumerate() {
            let per_row = (12 / widget.position.width.max(1)).max(1);
            assert_eq!(widget.position.y, index as u32 / per_row);
        }
    }

    #[test]
    fn apply_order_rejects_non_permutations() {
        let mut store = store();
        let mut ids: Vec<Uuid> = store.widgets().iter().map(|w| w.id).collect();
        ids.reverse();

        let reversed = ids.clone();
        store.apply_order(&ids).unwrap();
        let now: Vec<Uuid> = store.widgets().iter().map(|w| w.id).collect();
        assert_eq!(now, reversed);

        ids.pop();
        assert!(matches!(
            store.apply_order(&ids).unwrap_err(),
            CoreError::InvalidOperation { .. }
        ));

        ids.push(Uuid::new_v4());
        assert!(matches!(
            store.apply_order(&ids).unwrap_err(),
            CoreError::WidgetNotFound { .. }
        ));
    }

    #[test]
    fn responsive_override_wins_over_the_dimension_table() {
        let mut store = store();
        let id = store.widgets()[1].id;
        let pinned = WidgetPosition {
            x: 2,
            y: 9,
            width: 4,
            height: 1,
        };
        store.set_override(id, Breakpoint::Tablet, pinned).unwrap();

        let tablet = store.responsive_widgets(Breakpoint::Tablet);
        let widget = tablet.iter().find(|w| w.id == id).unwrap();
        assert_eq!(widget.position, pinned);

        // Other breakpoints still resolve from the table.
        let mobile = store.responsive_widgets(Breakpoint::Mobile);
        let widget = mobile.iter().find(|w| w.id == id).unwrap();
        assert_eq!(widget.position.width, 4);
        assert_ne!(widget.position, pinned);
    }

    #[test]
    fn hidden_widgets_are_excluded_from_responsive_resolution() {
        let mut store = store();
        let id = store.widgets()[0].id;
        store.set_visible(id, false).unwrap();

        let resolved = store.responsive_widgets(Breakpoint::Desktop);
        assert!(resolved.iter().all(|w| w.id != id));
        assert!(store.widget(id).is_some(), "hidden is not removed");
    }

    #[test]
    fn mobile_widgets_stack_in_a_single_column() {
        let store = store();
        let mobile = store.responsive_widgets(Breakpoint::Mobile);
        assert!(mobile.iter().all(|w| w.position.x == 0));
        assert!(mobile.iter().all(|w| w.position.width == 4));
    }

    #[test]
    fn save_clears_the_dirty_flag_and_stamps_updated_at() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = LayoutStore::new(backend.clone());
        assert!(!store.has_unsaved_changes());

        store.resize_widget(store.widgets()[0].id, WidgetSize::Small).unwrap();
        assert!(store.has_unsaved_changes());

        store.save_layout().unwrap();
        assert!(!store.has_unsaved_changes());
        assert!(store.updated_at().is_some());

        // A fresh store restores the saved layout.
        let restored = LayoutStore::load(backend).unwrap();
        assert_eq!(restored.widgets()[0].size, WidgetSize::Small);
        assert_eq!(restored.updated_at(), store.updated_at());
    }

    #[test]
    fn reset_restores_defaults_in_memory_only() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = LayoutStore::new(backend.clone());
        let id = store.add_widget("conversion-rate", None).unwrap();
        store.save_layout().unwrap();

        store.reset_layout();
        assert!(store.widget(id).is_none());
        assert!(store.has_unsaved_changes());

        // The persisted copy still has the extra widget.
        let reloaded = LayoutStore::load(backend).unwrap();
        assert!(reloaded.widget(id).is_some());
    }

    #[test]
    fn unknown_kind_and_preset_are_errors() {
        let mut store = store();
        assert!(matches!(
            store.add_widget("weather", None).unwrap_err(),
            CoreError::UnknownWidgetKind { .. }
        ));
        assert!(matches!(
            store.apply_preset("zen-garden").unwrap_err(),
            CoreError::PresetNotFound { .. }
        ));
    }

    #[test]
    fn presets_replace_the_layout() {
        let mut store = store();
        store.apply_preset("analytics").unwrap();

        let kinds: Vec<&str> = store.widgets().iter().map(|w| w.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "revenue-chart",
                "conversion-rate",
                "top-products",
                "customer-activity"
            ]
        );
        assert_eq!(store.widgets()[0].size, WidgetSize::Full);
    }

    #[test]
    fn locked_widgets_refuse_moves_and_resizes() {
        let mut store = store();
        let id = store.widgets()[0].id;
        store.set_locked(id, true).unwrap();

        let position = WidgetPosition {
            x: 0,
            y: 5,
            width: 6,
            height: 2,
        };
        assert!(matches!(
            store.move_widget(id, position).unwrap_err(),
            CoreError::InvalidOperation { .. }
        ));
        assert!(matches!(
            store.resize_widget(id, WidgetSize::Small).unwrap_err(),
            CoreError::InvalidOperation { .. }
        ));

        store.set_locked(id, false).unwrap();
        store.move_widget(id, position).unwrap();
        assert_eq!(store.widget(id).unwrap().position, position);
    }

    #[tokio::test]
    async fn snapshots_fan_out_over_the_watch_channel() {
        let mut store = store();
        let mut state = store.state();
        assert!(!state.current().has_unsaved_changes);

        store.remove_widget(store.widgets()[0].id).unwrap();
        let snap = state.changed().await.unwrap();
        assert!(snap.has_unsaved_changes);
        assert_eq!(snap.widgets.len(), 4);
    }
}
