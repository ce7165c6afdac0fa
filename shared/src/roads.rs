//! Immutable road geometry used for road-constrained motion.
//!
//! A [`RoadNetwork`] is loaded once and only read afterwards. It answers two
//! queries: a random point somewhere on the network, and "advance this point
//! along the nearest road by a distance". Both are linear scans over every
//! segment, which is fine for a few thousand segments at a few ticks per second.

use crate::Point2D;
use rand::Rng;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

/// Where random points land when the network has no roads.
pub const DEFAULT_LOCATION: Point2D = Point2D::new(0.0, 0.0);

/// Projection parameter past which `advance` follows the next segment's heading.
pub const LOOKAHEAD_THRESHOLD: f64 = 0.95;

#[derive(Debug, Error)]
pub enum RoadLoadError {
    #[error("Failed to read geometry file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Geometry file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported geometry layout: {0}")]
    Format(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoadSegment {
    pub p1: Point2D,
    pub p2: Point2D,
}

impl RoadSegment {
    pub fn new(p1: Point2D, p2: Point2D) -> Self {
        Self { p1, p2 }
    }

    pub fn direction(&self) -> Point2D {
        self.p2.sub(&self.p1)
    }

    pub fn length(&self) -> f64 {
        self.direction().length()
    }

    /// Projects `point` onto the segment. Returns the clamped parameter in
    /// `[0, 1]` and the closest point on the segment.
    pub fn project(&self, point: &Point2D) -> (f64, Point2D) {
        let d = self.direction();
        let len_sq = d.dot(&d);
        if len_sq <= f64::EPSILON {
            return (0.0, self.p1);
        }
        let t = (point.sub(&self.p1).dot(&d) / len_sq).clamp(0.0, 1.0);
        (t, self.p1.lerp(&self.p2, t))
    }
}

/// A polyline made of consecutive segments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Road {
    segments: Vec<RoadSegment>,
}

impl Road {
    pub fn from_polyline(points: &[Point2D]) -> Self {
        let segments = points
            .windows(2)
            .map(|pair| RoadSegment::new(pair[0], pair[1]))
            .collect();
        Self { segments }
    }

    pub fn segments(&self) -> &[RoadSegment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

/// Result of a nearest-segment query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NearestSegment {
    pub road: usize,
    pub segment: usize,
    /// Clamped projection parameter along the segment.
    pub t: f64,
    pub point: Point2D,
    pub distance: f64,
}

#[derive(Debug, Clone, Default)]
pub struct RoadNetwork {
    roads: Vec<Road>,
}

impl RoadNetwork {
    /// Builds a network, dropping roads with fewer than two points.
    pub fn new(roads: Vec<Road>) -> Self {
        Self {
            roads: roads.into_iter().filter(|r| !r.is_empty()).collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_polylines<I>(polylines: I) -> Self
    where
        I: IntoIterator<Item = Vec<Point2D>>,
    {
        Self::new(
            polylines
                .into_iter()
                .map(|points| Road::from_polyline(&points))
                .collect(),
        )
    }

    /// Loads road geometry from a JSON file.
    ///
    /// Accepts a GeoJSON `FeatureCollection`, a bare array of features
    /// (`{"geometry": {...}}`), or a bare array of geometries. `LineString` and
    /// `MultiLineString` geometries become roads; everything else (building
    /// polygons, points) is ignored.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, RoadLoadError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, RoadLoadError> {
        let root: Value = serde_json::from_str(text)?;
        let items = match &root {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("features") {
                Some(Value::Array(items)) => items,
                _ => {
                    return Err(RoadLoadError::Format(
                        "object root without a `features` array".to_string(),
                    ))
                }
            },
            _ => {
                return Err(RoadLoadError::Format(
                    "root must be an array or a FeatureCollection".to_string(),
                ))
            }
        };

        let mut polylines = Vec::new();
        for item in items {
            let geometry = item.get("geometry").unwrap_or(item);
            collect_polylines(geometry, &mut polylines);
        }
        Ok(Self::from_polylines(polylines))
    }

    pub fn roads(&self) -> &[Road] {
        &self.roads
    }

    pub fn is_empty(&self) -> bool {
        self.roads.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.roads.iter().map(|r| r.segments.len()).sum()
    }

    /// Uniformly random road, then uniformly random segment on it, then a
    /// uniformly random point along that segment.
    ///
    /// Segment choice is not weighted by length, so short segments and roads
    /// with few segments are over-represented.
    pub fn random_point<R: Rng + ?Sized>(&self, rng: &mut R) -> Point2D {
        if self.roads.is_empty() {
            return DEFAULT_LOCATION;
        }
        let road = &self.roads[rng.gen_range(0..self.roads.len())];
        let segment = &road.segments[rng.gen_range(0..road.segments.len())];
        let t: f64 = rng.gen_range(0.0..=1.0);
        segment.p1.lerp(&segment.p2, t)
    }

    /// Finds the segment closest to `from`. Ties go to the first segment in
    /// iteration order.
    pub fn nearest(&self, from: &Point2D) -> Option<NearestSegment> {
        let mut best: Option<NearestSegment> = None;
        for (road_idx, road) in self.roads.iter().enumerate() {
            for (seg_idx, segment) in road.segments.iter().enumerate() {
                let (t, point) = segment.project(from);
                let distance = from.distance(&point);
                if best.map_or(true, |b| distance < b.distance) {
                    best = Some(NearestSegment {
                        road: road_idx,
                        segment: seg_idx,
                        t,
                        point,
                        distance,
                    });
                }
            }
        }
        best
    }

    /// Moves `from` by `step` along the heading of the nearest segment.
    ///
    /// Near the end of a segment (`t >= 0.95`) the heading of the following
    /// segment of the same road is used instead, so agents turn before they
    /// overshoot a corner. With no roads at all, `from` is jittered by at most
    /// `step / 2` on each axis.
    pub fn advance<R: Rng + ?Sized>(&self, from: Point2D, step: f64, rng: &mut R) -> Point2D {
        let Some(nearest) = self.nearest(&from) else {
            let half = step.abs() / 2.0;
            if half == 0.0 {
                return from;
            }
            return Point2D::new(
                from.x + rng.gen_range(-half..=half),
                from.y + rng.gen_range(-half..=half),
            );
        };

        let road = &self.roads[nearest.road];
        let mut heading = road.segments[nearest.segment].direction();
        if nearest.t >= LOOKAHEAD_THRESHOLD {
            if let Some(next) = road.segments.get(nearest.segment + 1) {
                heading = next.direction();
            }
        }

        match heading.normalized() {
            Some(unit) => from.add(&unit.scale(step)),
            None => from,
        }
    }
}

fn collect_polylines(geometry: &Value, out: &mut Vec<Vec<Point2D>>) {
    let kind = geometry.get("type").and_then(Value::as_str);
    let coordinates = geometry.get("coordinates");
    match (kind, coordinates) {
        (Some("LineString"), Some(coords)) => {
            if let Some(line) = parse_line(coords) {
                out.push(line);
            }
        }
        (Some("MultiLineString"), Some(Value::Array(lines))) => {
            out.extend(lines.iter().filter_map(parse_line));
        }
        (None, Some(coords)) => {
            // Untyped geometry: treat a bare coordinate list as a polyline.
            if let Some(line) = parse_line(coords) {
                out.push(line);
            }
        }
        _ => {}
    }
}

fn parse_line(coords: &Value) -> Option<Vec<Point2D>> {
    let positions = coords.as_array()?;
    let points: Vec<Point2D> = positions
        .iter()
        .filter_map(|pos| {
            let pair = pos.as_array()?;
            let x = pair.first()?.as_f64()?;
            let y = pair.get(1)?.as_f64()?;
            Some(Point2D::new(x, y))
        })
        .collect();
    if points.len() < 2 {
        None
    } else {
        Some(points)
    }
}
