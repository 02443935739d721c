//! Per-frame dispatch from ingestion sessions to the broadcast hub

use crate::algorithms::{MultilaterationSolver, SolverMethod};
use crate::broadcast::{BroadcastHub, PublishReport};
use crate::core::{MeasurementFrame, TagPosition, MIN_ANCHORS, TAG_POSITION_EVENT, UWB_DATA_EVENT};
use crate::utils::AnchorSet;
use serde::Serialize;
use std::sync::Arc;

/// Anchor layout plus solver, shared by every session
#[derive(Debug)]
pub struct Positioner {
    anchors: Arc<AnchorSet>,
    solver: MultilaterationSolver,
}

impl Positioner {
    pub fn new(anchors: Arc<AnchorSet>, solver: MultilaterationSolver) -> Self {
        Self { anchors, solver }
    }

    /// Solve one frame against the known anchors, returning the IDs used
    pub fn locate(&self, frame: &MeasurementFrame) -> (TagPosition, Vec<String>) {
        let (anchors, distances) = self.anchors.pair_links(&frame.links);
        let position = self.solver.solve(&anchors, &distances);
        let used = match self.solver.method {
            SolverMethod::Trilateration => anchors.len().min(MIN_ANCHORS),
            SolverMethod::LeastSquares => anchors.len(),
        };
        let ids = anchors.into_iter().take(used).map(|a| a.id).collect();
        (position, ids)
    }
}

/// Payload of the `tag_position` event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionUpdate {
    pub x: f64,
    pub y: f64,
    pub residual: f64,
    pub anchors: Vec<String>,
}

/// What happened to one frame
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Fan-out result of the `uwb_data` event
    pub links: PublishReport,
    /// Solver result, `None` when positioning is off or the frame had no links
    pub position: Option<TagPosition>,
}

/// Forwards frames to the hub, solving positions on the way when configured
#[derive(Clone)]
pub struct FramePipeline {
    hub: BroadcastHub,
    positioner: Option<Arc<Positioner>>,
}

impl FramePipeline {
    pub fn new(hub: BroadcastHub, positioner: Option<Positioner>) -> Self {
        Self {
            hub,
            positioner: positioner.map(Arc::new),
        }
    }

    /// Relay raw frames only
    pub fn relay_only(hub: BroadcastHub) -> Self {
        Self::new(hub, None)
    }

    pub fn positioning_enabled(&self) -> bool {
        self.positioner.is_some()
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    /// Publish a frame's links and, if enabled, its solved position
    pub fn dispatch(&self, frame: &MeasurementFrame) -> Dispatch {
        let links = match frame.links_payload() {
            Ok(payload) => self.hub.publish(UWB_DATA_EVENT, payload),
            Err(e) => {
                tracing::warn!("failed to encode links: {}", e);
                PublishReport::default()
            }
        };

        let position = match &self.positioner {
            Some(positioner) if !frame.is_empty() => {
                let (position, anchors) = positioner.locate(frame);
                if let TagPosition::Solved { x, y, residual } = position {
                    tracing::debug!(x, y, residual, "tag position solved");
                    let update = PositionUpdate { x, y, residual, anchors };
                    if let Err(e) = self.hub.publish_json(TAG_POSITION_EVENT, &update) {
                        tracing::warn!("failed to encode position: {}", e);
                    }
                }
                Some(position)
            }
            _ => None,
        };

        Dispatch { links, position }
    }
}
