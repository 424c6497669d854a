//! Board document model — objects, entity positions, and coordinate frames.
//!
//! DESIGN
//! ======
//! A `Board` is one persisted document: a map of board objects (zones and
//! text annotations) plus a map of positioned entities. Objects always carry
//! absolute board coordinates. An entity position with a `parent_id` is
//! relative to that zone's origin; without one it is absolute.
//!
//! COORDINATE FRAMES
//! =================
//! Pinning converts absolute → relative and unpinning converts relative →
//! absolute. Each conversion happens exactly once per transition; callers
//! store the converted value and never re-derive it from the old frame.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocError {
    #[error("unknown entity: {0}")]
    UnknownEntity(String),
    #[error("unknown zone: {0}")]
    UnknownZone(String),
    #[error("object is not a zone: {0}")]
    NotAZone(String),
}

// =============================================================================
// GEOMETRY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Largest per-axis distance to `other`.
    #[must_use]
    pub fn delta(self, other: Point) -> f64 {
        (self.x - other.x).abs().max((self.y - other.y).abs())
    }
}

/// Express an absolute point in a zone's frame.
#[must_use]
pub fn to_relative(absolute: Point, zone_origin: Point) -> Point {
    Point::new(absolute.x - zone_origin.x, absolute.y - zone_origin.y)
}

/// Express a zone-relative point in board coordinates.
#[must_use]
pub fn to_absolute(relative: Point, zone_origin: Point) -> Point {
    Point::new(relative.x + zone_origin.x, relative.y + zone_origin.y)
}

// =============================================================================
// OBJECTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub label: String,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Opaque trigger configuration owned by the automation layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextNote {
    pub x: f64,
    pub y: f64,
    pub text: String,
    pub font_size: f64,
    pub color: String,
}

/// A zone or text annotation placed on the board.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoardObject {
    Zone(Zone),
    Text(TextNote),
}

impl BoardObject {
    #[must_use]
    pub fn origin(&self) -> Point {
        match self {
            Self::Zone(z) => Point::new(z.x, z.y),
            Self::Text(t) => Point::new(t.x, t.y),
        }
    }

    pub fn set_origin(&mut self, p: Point) {
        match self {
            Self::Zone(z) => {
                z.x = p.x;
                z.y = p.y;
            }
            Self::Text(t) => {
                t.x = p.x;
                t.y = p.y;
            }
        }
    }

    #[must_use]
    pub fn is_zone(&self) -> bool {
        matches!(self, Self::Zone(_))
    }

    /// Width and height for sized objects. Text sizes itself from its content.
    #[must_use]
    pub fn size(&self) -> Option<(f64, f64)> {
        match self {
            Self::Zone(z) => Some((z.width, z.height)),
            Self::Text(_) => None,
        }
    }

    /// Resize a zone. Returns false for objects without explicit dimensions.
    pub fn resize(&mut self, width: f64, height: f64) -> bool {
        match self {
            Self::Zone(z) => {
                z.width = width;
                z.height = height;
                true
            }
            Self::Text(_) => false,
        }
    }

    /// Equality with a tolerance on geometry and exact match on everything else.
    #[must_use]
    pub fn approx_eq(&self, other: &BoardObject, tolerance: f64) -> bool {
        if self.origin().delta(other.origin()) > tolerance {
            return false;
        }
        let mut a = self.clone();
        let mut b = other.clone();
        a.set_origin(Point::default());
        b.set_origin(Point::default());
        match (a.size(), b.size()) {
            (Some((aw, ah)), Some((bw, bh))) => {
                if (aw - bw).abs() > tolerance || (ah - bh).abs() > tolerance {
                    return false;
                }
                a.resize(0.0, 0.0);
                b.resize(0.0, 0.0);
            }
            (None, None) => {}
            _ => return false,
        }
        a == b
    }
}

// =============================================================================
// POSITIONS
// =============================================================================

/// Where a positioned entity sits. Relative to `parent_id` when set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Position {
    #[must_use]
    pub fn absolute(x: f64, y: f64) -> Self {
        Self { x, y, parent_id: None }
    }

    #[must_use]
    pub fn pinned(x: f64, y: f64, zone_id: impl Into<String>) -> Self {
        Self { x, y, parent_id: Some(zone_id.into()) }
    }

    #[must_use]
    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }

    /// Same frame and coordinates within `tolerance`.
    #[must_use]
    pub fn approx_eq(&self, other: &Position, tolerance: f64) -> bool {
        self.parent_id == other.parent_id && self.point().delta(other.point()) <= tolerance
    }
}

// =============================================================================
// BOARD
// =============================================================================

/// The shared board document.
/// The two id spaces of a board. Object ids and entity ids are unrelated,
/// so a removal in one never shadows the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    Object,
    Position,
}

impl EntryKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Object => "object:",
            Self::Position => "position:",
        }
    }

    /// Key under which a removal of `id` is recorded in `Board::tombstones`.
    #[must_use]
    pub fn tombstone_key(self, id: &str) -> String {
        format!("{}{id}", self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Board {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Option<Uuid>,
    pub objects: BTreeMap<String, BoardObject>,
    pub positions: BTreeMap<String, Position>,
    /// Removed entries → removal time, keyed by [`EntryKind::tombstone_key`].
    /// Upserts for these entries are refused until pruned.
    #[serde(default)]
    pub tombstones: BTreeMap<String, String>,
    /// Incremented on every persisted write.
    #[serde(default)]
    pub version: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// Current UTC time as an RFC 3339 string.
#[must_use]
pub fn now_iso() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// Parse an RFC 3339 timestamp.
#[must_use]
pub fn parse_iso(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339).ok()
}

impl Board {
    #[must_use]
    pub fn new(id: Uuid, name: impl Into<String>, owner_id: Option<Uuid>) -> Self {
        let now = now_iso();
        Self {
            id,
            name: name.into(),
            owner_id,
            objects: BTreeMap::new(),
            positions: BTreeMap::new(),
            tombstones: BTreeMap::new(),
            version: 0,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Stamp a successful write.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = now_iso();
    }

    /// Objects and positions match. Bookkeeping fields are ignored.
    #[must_use]
    pub fn same_content(&self, other: &Board) -> bool {
        self.objects == other.objects && self.positions == other.positions
    }

    /// Origin of a zone, or an error naming what's wrong with the reference.
    ///
    /// # Errors
    ///
    /// `UnknownZone` if the id is absent, `NotAZone` if it names a text object.
    pub fn zone_origin(&self, zone_id: &str) -> Result<Point, DocError> {
        match self.objects.get(zone_id) {
            Some(obj) if obj.is_zone() => Ok(obj.origin()),
            Some(_) => Err(DocError::NotAZone(zone_id.to_owned())),
            None => Err(DocError::UnknownZone(zone_id.to_owned())),
        }
    }

    /// Check that a position's parent reference points at an existing zone.
    ///
    /// # Errors
    ///
    /// Same as [`Board::zone_origin`].
    pub fn validate_parent(&self, position: &Position) -> Result<(), DocError> {
        match &position.parent_id {
            Some(zone_id) => self.zone_origin(zone_id).map(|_| ()),
            None => Ok(()),
        }
    }

    /// Render position of an entity in board coordinates.
    ///
    /// A dangling parent reference (zone removed but the unpin not yet
    /// observed) falls back to treating the stored coordinates as absolute.
    #[must_use]
    pub fn absolute_position(&self, entity_id: &str) -> Option<Point> {
        let pos = self.positions.get(entity_id)?;
        let Some(zone_id) = &pos.parent_id else {
            return Some(pos.point());
        };
        match self.zone_origin(zone_id) {
            Ok(origin) => Some(to_absolute(pos.point(), origin)),
            Err(_) => Some(pos.point()),
        }
    }

    /// Compute the pinned position for an entity without storing it.
    ///
    /// An entity already pinned elsewhere is first resolved to absolute, so
    /// re-pinning converts through board coordinates once.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` if the entity has no position, zone errors otherwise.
    pub fn pinned_position(&self, entity_id: &str, zone_id: &str) -> Result<Position, DocError> {
        let origin = self.zone_origin(zone_id)?;
        let absolute = self
            .absolute_position(entity_id)
            .ok_or_else(|| DocError::UnknownEntity(entity_id.to_owned()))?;
        let rel = to_relative(absolute, origin);
        Ok(Position::pinned(rel.x, rel.y, zone_id))
    }

    /// Compute the absolute position for an entity without storing it.
    ///
    /// # Errors
    ///
    /// `UnknownEntity` if the entity has no position.
    pub fn unpinned_position(&self, entity_id: &str) -> Result<Position, DocError> {
        let absolute = self
            .absolute_position(entity_id)
            .ok_or_else(|| DocError::UnknownEntity(entity_id.to_owned()))?;
        Ok(Position::absolute(absolute.x, absolute.y))
    }

    /// Unpin every entity pinned to `zone_id`, converting each back to
    /// absolute using the zone's current origin. Must run before the zone
    /// itself is removed. Returns the ids that changed.
    pub fn unpin_children(&mut self, zone_id: &str) -> Vec<String> {
        let Ok(origin) = self.zone_origin(zone_id) else {
            return Vec::new();
        };
        let mut changed = Vec::new();
        for (entity_id, pos) in &mut self.positions {
            if pos.parent_id.as_deref() != Some(zone_id) {
                continue;
            }
            let abs = to_absolute(pos.point(), origin);
            *pos = Position::absolute(abs.x, abs.y);
            changed.push(entity_id.clone());
        }
        changed
    }

    /// Record a removal. Existing tombstones keep their original time.
    pub fn bury(&mut self, kind: EntryKind, id: &str) {
        self.tombstones.entry(kind.tombstone_key(id)).or_insert_with(now_iso);
    }

    #[must_use]
    pub fn is_buried(&self, kind: EntryKind, id: &str) -> bool {
        self.tombstones.contains_key(&kind.tombstone_key(id))
    }

    /// Ids of one kind with a live tombstone.
    pub fn buried(&self, kind: EntryKind) -> impl Iterator<Item = &str> {
        self.tombstones.keys().filter_map(move |key| key.strip_prefix(kind.prefix()))
    }

    /// Drop tombstones older than `retention`. Unparseable entries are dropped.
    pub fn prune_tombstones(&mut self, now: OffsetDateTime, retention: std::time::Duration) {
        self.tombstones.retain(|_, at| {
            parse_iso(at).is_some_and(|t| (now - t).unsigned_abs() < retention)
        });
    }
}

#[cfg(test)]
#[path = "doc_test.rs"]
mod tests;
