//! Ephemeral presence: who is where in the document.
//!
//! Cursors and selections ride alongside operations but never touch the
//! revision history. Nothing here is persisted, and nothing here can block
//! or reorder an edit.
//!
//! ```text
//! local caret move
//!       │
//!       ▼
//! LocalPresence::update_cursor()      (throttled, 33ms)
//!       │
//!       ▼   cursor-update
//! Sequencer ── PresenceTracker ── rebroadcast (unstamped)
//!       │
//!       ▼
//! remote PresenceTracker::update_cursor()
//! ```

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::protocol::ClientId;

/// Caret position, zero-based line and column.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Cursor {
    pub line: u32,
    pub column: u32,
}

impl Cursor {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }
}

/// A selected range between two carets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: Cursor,
    pub end: Cursor,
}

impl Selection {
    pub fn new(start: Cursor, end: Cursor) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Same range with `start <= end`.
    pub fn normalized(self) -> Self {
        if self.start <= self.end {
            self
        } else {
            Self { start: self.end, end: self.start }
        }
    }
}

/// Presence of one collaborator.
#[derive(Debug, Clone)]
pub struct PresenceState {
    pub cursor: Option<Cursor>,
    pub selection: Option<Selection>,
    pub is_active: bool,
    last_update: Instant,
}

impl PresenceState {
    fn new() -> Self {
        Self {
            cursor: None,
            selection: None,
            is_active: true,
            last_update: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.is_active = true;
        self.last_update = Instant::now();
    }

    /// Time since the last cursor or selection update.
    pub fn idle_for(&self) -> Duration {
        self.last_update.elapsed()
    }
}

/// Presence of every collaborator in one session.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: HashMap<ClientId, PresenceState>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a collaborator with no cursor yet.
    pub fn insert(&mut self, id: ClientId) {
        self.entries.entry(id).or_insert_with(PresenceState::new);
    }

    /// Seed an entry from a snapshot (session-state / client-joined).
    pub fn seed(&mut self, id: ClientId, cursor: Option<Cursor>, selection: Option<Selection>) {
        let entry = self.entries.entry(id).or_insert_with(PresenceState::new);
        entry.cursor = cursor;
        entry.selection = selection;
    }

    /// Record a cursor move. Unknown collaborators get a placeholder entry,
    /// since presence can outrun the matching client-joined.
    pub fn update_cursor(&mut self, id: ClientId, cursor: Cursor) {
        let entry = self.entries.entry(id).or_insert_with(PresenceState::new);
        entry.cursor = Some(cursor);
        entry.touch();
    }

    pub fn update_selection(&mut self, id: ClientId, selection: Option<Selection>) {
        let entry = self.entries.entry(id).or_insert_with(PresenceState::new);
        entry.selection = selection;
        entry.touch();
    }

    pub fn remove(&mut self, id: &ClientId) -> Option<PresenceState> {
        self.entries.remove(id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn get(&self, id: &ClientId) -> Option<&PresenceState> {
        self.entries.get(id)
    }

    pub fn cursor(&self, id: &ClientId) -> Option<Cursor> {
        self.entries.get(id).and_then(|p| p.cursor)
    }

    pub fn selection(&self, id: &ClientId) -> Option<Selection> {
        self.entries.get(id).and_then(|p| p.selection)
    }

    pub fn is_active(&self, id: &ClientId) -> bool {
        self.entries.get(id).is_some_and(|p| p.is_active)
    }

    /// Flag collaborators idle for longer than `timeout` as inactive.
    ///
    /// Returns the ids that became inactive on this call.
    pub fn mark_idle(&mut self, timeout: Duration) -> Vec<ClientId> {
        let mut newly_idle = Vec::new();
        for (id, state) in self.entries.iter_mut() {
            if state.is_active && state.idle_for() > timeout {
                state.is_active = false;
                newly_idle.push(*id);
            }
        }
        newly_idle
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The local user's caret, throttled before it goes on the wire.
///
/// Cursor moves are limited to one per `interval`. Selections always go out
/// immediately.
#[derive(Debug)]
pub struct LocalPresence {
    cursor: Option<Cursor>,
    selection: Option<Selection>,
    sent_cursor: Option<Cursor>,
    last_cursor_broadcast: Option<Instant>,
    interval: Duration,
}

impl LocalPresence {
    pub fn new(interval: Duration) -> Self {
        Self {
            cursor: None,
            selection: None,
            sent_cursor: None,
            last_cursor_broadcast: None,
            interval,
        }
    }

    /// Record a caret move; returns the cursor to send, or `None` if
    /// throttled or unchanged.
    pub fn update_cursor(&mut self, cursor: Cursor) -> Option<Cursor> {
        self.cursor = Some(cursor);
        if self.sent_cursor == Some(cursor) {
            return None;
        }
        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.interval {
                return None;
            }
        }
        self.mark_sent(cursor);
        Some(cursor)
    }

    /// Send the latest caret regardless of throttling, if one was held back.
    pub fn flush_cursor(&mut self) -> Option<Cursor> {
        let cursor = self.cursor?;
        if self.sent_cursor == Some(cursor) {
            return None;
        }
        self.mark_sent(cursor);
        Some(cursor)
    }

    pub fn update_selection(&mut self, selection: Option<Selection>) -> Option<Selection> {
        self.selection = selection;
        selection
    }

    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    /// Forget what was sent, so the next update goes out after a reconnect.
    pub fn reset(&mut self) {
        self.sent_cursor = None;
        self.last_cursor_broadcast = None;
    }

    fn mark_sent(&mut self, cursor: Cursor) {
        self.sent_cursor = Some(cursor);
        self.last_cursor_broadcast = Some(Instant::now());
    }
}

impl Default for LocalPresence {
    fn default() -> Self {
        Self::new(Duration::from_millis(33))
    }
}

/// Stable, visually distinct `#rrggbb` color derived from a client id.
pub fn color_for(id: ClientId) -> String {
    let hue = (id.as_uuid().as_u128() % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
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
        p + (q - p) * 6.0 * t
    } else if t < 1.0 / 2.0 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}
