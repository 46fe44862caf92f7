//! Presence store: who is in a document room and what they are doing.
//!
//! Records are keyed by `(document_id, user_id)`, not by connection, so a
//! user reconnecting (or editing from two tabs) shows up once.
//!
//! ```text
//! join-room ──► upsert() ──► presence:list (room) + presence:updated (others)
//! presence-update ──► update() ──► presence:updated (others)
//! presence-heartbeat ──► heartbeat() ──► presence:updated only on Idle/Away → Active
//! sweep timer ──► sweep() ──► presence:updated (room) on Active → Idle → Away
//! leave / disconnect ──► remove() ──► presence:removed (remaining)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Liveness of a user in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PresenceStatus {
    Active,
    Idle,
    Away,
}

/// Caret position in the editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub index: u32,
}

/// Selected range as document offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    pub from: u32,
    pub to: u32,
}

/// Live editing state for one user in one room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: Uuid,
    pub display_name: String,
    pub avatar_url: Option<String>,
    /// CSS hex color, `#rrggbb`.
    pub color: String,
    pub status: PresenceStatus,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<SelectionRange>,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

impl PresenceRecord {
    /// Fresh active record with no cursor or selection.
    pub fn new(
        user_id: Uuid,
        display_name: impl Into<String>,
        avatar_url: Option<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar_url,
            color: color.into(),
            status: PresenceStatus::Active,
            cursor: None,
            selection: None,
            updated_at: now_millis(),
        }
    }

    /// Merge the fields present in `patch`. Identity is never touched.
    pub fn apply(&mut self, patch: &PresencePatch) {
        if let Some(name) = &patch.display_name {
            self.display_name = name.clone();
        }
        if let Some(avatar) = &patch.avatar_url {
            self.avatar_url = avatar.clone();
        }
        if let Some(color) = &patch.color {
            self.color = color.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(cursor) = patch.cursor {
            self.cursor = cursor;
        }
        if let Some(selection) = patch.selection {
            self.selection = selection;
        }
    }
}

/// Partial presence update sent by a client.
///
/// `None` leaves a field untouched. For the optional fields, `Some(None)`
/// clears the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresencePatch {
    pub display_name: Option<String>,
    pub avatar_url: Option<Option<String>>,
    pub color: Option<String>,
    pub status: Option<PresenceStatus>,
    pub cursor: Option<Option<CursorPosition>>,
    pub selection: Option<Option<SelectionRange>>,
}

impl PresencePatch {
    pub fn cursor(position: CursorPosition) -> Self {
        Self {
            cursor: Some(Some(position)),
            ..Self::default()
        }
    }

    pub fn selection(range: Option<SelectionRange>) -> Self {
        Self {
            selection: Some(range),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Result of a heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub enum Heartbeat {
    /// No record for this user in this room; dropped.
    Unknown,
    /// Already active, timestamp refreshed.
    Refreshed,
    /// Was idle or away, now active again.
    Reactivated(PresenceRecord),
}

/// Inactivity thresholds applied by [`PresenceStore::sweep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresencePolicy {
    pub idle_after: Duration,
    pub away_after: Duration,
}

impl Default for PresencePolicy {
    fn default() -> Self {
        // Clients heartbeat every 30s: idle after three missed beats.
        Self {
            idle_after: Duration::from_secs(90),
            away_after: Duration::from_secs(300),
        }
    }
}

/// Per-room presence records.
#[derive(Debug, Default)]
pub struct PresenceStore {
    rooms: HashMap<Uuid, HashMap<Uuid, PresenceRecord>>,
}

impl PresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or fully replace the record for `record.user_id`, stamped `now_ms`.
    ///
    /// Returns the room snapshot after the write, so the caller always sees
    /// the upserted user in it.
    pub fn upsert(
        &mut self,
        document_id: Uuid,
        mut record: PresenceRecord,
        now_ms: u64,
    ) -> Vec<PresenceRecord> {
        record.updated_at = now_ms;
        self.rooms
            .entry(document_id)
            .or_default()
            .insert(record.user_id, record);
        self.snapshot(document_id)
    }

    /// Merge `patch` into an existing record. Unknown users are ignored.
    pub fn update(
        &mut self,
        document_id: Uuid,
        user_id: Uuid,
        patch: &PresencePatch,
        now_ms: u64,
    ) -> Option<PresenceRecord> {
        let record = self.rooms.get_mut(&document_id)?.get_mut(&user_id)?;
        record.apply(patch);
        record.updated_at = now_ms;
        Some(record.clone())
    }

    /// Mark the user active and refresh the timestamp. Cursor and selection stay.
    pub fn heartbeat(&mut self, document_id: Uuid, user_id: Uuid, now_ms: u64) -> Heartbeat {
        let Some(record) = self
            .rooms
            .get_mut(&document_id)
            .and_then(|room| room.get_mut(&user_id))
        else {
            return Heartbeat::Unknown;
        };

        let was_active = record.status == PresenceStatus::Active;
        record.status = PresenceStatus::Active;
        record.updated_at = now_ms;

        if was_active {
            Heartbeat::Refreshed
        } else {
            Heartbeat::Reactivated(record.clone())
        }
    }

    /// Delete the record. The room bucket goes away with its last record.
    pub fn remove(&mut self, document_id: Uuid, user_id: Uuid) -> Option<PresenceRecord> {
        let room = self.rooms.get_mut(&document_id)?;
        let removed = room.remove(&user_id);
        if room.is_empty() {
            self.rooms.remove(&document_id);
        }
        removed
    }

    /// All records in the room, ordered by display name then user id.
    pub fn snapshot(&self, document_id: Uuid) -> Vec<PresenceRecord> {
        let mut list: Vec<PresenceRecord> = self
            .rooms
            .get(&document_id)
            .map(|room| room.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        list
    }

    pub fn get(&self, document_id: Uuid, user_id: Uuid) -> Option<&PresenceRecord> {
        self.rooms.get(&document_id)?.get(&user_id)
    }

    /// Downgrade stale records (Active → Idle → Away).
    ///
    /// Returns every record whose status changed, with its room. The
    /// timestamp is left alone so the away threshold keeps counting from the
    /// last real activity.
    pub fn sweep(&mut self, now_ms: u64, policy: &PresencePolicy) -> Vec<(Uuid, PresenceRecord)> {
        let idle_ms = duration_millis(policy.idle_after);
        let away_ms = duration_millis(policy.away_after);
        let mut changed = Vec::new();

        for (document_id, room) in &mut self.rooms {
            for record in room.values_mut() {
                let quiet = now_ms.saturating_sub(record.updated_at);
                let next = if quiet >= away_ms {
                    PresenceStatus::Away
                } else if quiet >= idle_ms {
                    PresenceStatus::Idle
                } else {
                    continue;
                };
                // Only downgrade; an explicit Away set by the client stays Away.
                if rank(next) > rank(record.status) {
                    record.status = next;
                    changed.push((*document_id, record.clone()));
                }
            }
        }

        changed
    }

    /// Number of rooms with at least one record.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Number of records in one room.
    pub fn len(&self, document_id: Uuid) -> usize {
        self.rooms.get(&document_id).map_or(0, HashMap::len)
    }
}

fn rank(status: PresenceStatus) -> u8 {
    match status {
        PresenceStatus::Active => 0,
        PresenceStatus::Idle => 1,
        PresenceStatus::Away => 2,
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or_default()
}

/// Stable, vivid `#rrggbb` color for a user.
///
/// Hue comes from the id so the same user keeps the same color across
/// sessions and rooms.
pub fn color_for_user(user_id: Uuid) -> String {
    let hue = ((user_id.as_u128() % 360) as f32) / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        to_channel(r),
        to_channel(g),
        to_channel(b)
    )
}

fn to_channel(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}
