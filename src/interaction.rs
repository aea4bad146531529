//! Hover and selection, tracked as one id each, and the style they imply.
//!
//! Hover and selection are independent: selecting a feature does not stop
//! hover bookkeeping. Styling gives selection priority over hover.
//! Clicking the selected feature again deselects it.

use serde::Serialize;

use crate::geometry::{point_radius, StyleFamily};
use crate::types::Feature;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerEvent {
    Enter(String),
    Leave,
    Click(String),
    /// Click on the map where no feature is.
    ClickEmpty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InteractionState {
    pub hovered_id: Option<String>,
    pub selected_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase<'a> {
    Idle,
    Hovering(&'a str),
    Selected(&'a str),
}

#[derive(Debug, Default)]
pub struct InteractionTracker {
    state: InteractionState,
}

impl InteractionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &InteractionState {
        &self.state
    }

    /// Selection dominates hover when both are set.
    pub fn phase(&self) -> Phase<'_> {
        match (&self.state.selected_id, &self.state.hovered_id) {
            (Some(id), _) => Phase::Selected(id),
            (None, Some(id)) => Phase::Hovering(id),
            (None, None) => Phase::Idle,
        }
    }

    /// Returns true when the state changed.
    pub fn apply(&mut self, event: PointerEvent) -> bool {
        let before = self.state.clone();
        match event {
            PointerEvent::Enter(id) => self.state.hovered_id = Some(id),
            PointerEvent::Leave => self.state.hovered_id = None,
            PointerEvent::Click(id) => {
                if self.state.selected_id.as_deref() == Some(id.as_str()) {
                    self.state.selected_id = None;
                } else {
                    self.state.selected_id = Some(id);
                }
            }
            PointerEvent::ClickEmpty => self.state.selected_id = None,
        }
        self.state != before
    }

    pub fn clear_selection(&mut self) {
        self.state.selected_id = None;
    }

    /// Drops hover and selection ids for which `exists` is false.
    pub fn prune(&mut self, exists: impl Fn(&str) -> bool) -> bool {
        let before = self.state.clone();
        if self.state.hovered_id.as_deref().is_some_and(|id| !exists(id)) {
            self.state.hovered_id = None;
        }
        if self.state.selected_id.as_deref().is_some_and(|id| !exists(id)) {
            self.state.selected_id = None;
        }
        self.state != before
    }

    pub fn reset(&mut self) {
        self.state = InteractionState::default();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureStyle {
    pub fill_color: String,
    pub opacity: f64,
    pub stroke_color: &'static str,
    pub stroke_width: f64,
    pub stroke_opacity: f64,
    /// Point markers only.
    pub radius: Option<f64>,
}

const SELECTED_STROKE: &str = "#1d4f29";

/// Style from the feature's id, colour and geometry kind plus the
/// interaction state; nothing else feeds into it.
pub fn style_of(feature: &Feature, state: &InteractionState, zoom: f64) -> FeatureStyle {
    let id = Some(feature.id.as_str());
    let selected = state.selected_id.as_deref() == id;
    let hovered = state.hovered_id.as_deref() == id;
    let fill_color = feature.properties.color_hex.clone();

    match feature.geometry.kind().style_family() {
        StyleFamily::Area => {
            let (opacity, stroke_color, stroke_width, stroke_opacity) = if selected {
                (0.85, SELECTED_STROKE, 4.0, 1.0)
            } else if hovered {
                (0.75, "#000000", 3.0, 1.0)
            } else {
                (0.65, "#000000", 2.0, 0.9)
            };
            FeatureStyle { fill_color, opacity, stroke_color, stroke_width, stroke_opacity, radius: None }
        }
        StyleFamily::Marker => {
            let (opacity, stroke_color, stroke_width) = if selected {
                (0.9, SELECTED_STROKE, 3.0)
            } else if hovered {
                (0.8, "#000000", 2.0)
            } else {
                (0.7, "#333333", 1.5)
            };
            FeatureStyle {
                fill_color,
                opacity,
                stroke_color,
                stroke_width,
                stroke_opacity: 1.0,
                radius: Some(point_radius(zoom)),
            }
        }
    }
}
