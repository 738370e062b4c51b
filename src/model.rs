use std::fmt::Debug;
use std::hash::Hash;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unix milliseconds. Every instant in the crate uses it.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 3_600_000;

pub type TaskId = u64;
pub type ClaimId = u64;
pub type ResourceId = u64;
pub type ProjectId = u64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Closed-interval retention test used for window pruning:
    /// keeps anything with `end >= self.start && start <= self.end`.
    pub fn retains(&self, start: Ms, end: Ms) -> bool {
        end >= self.start && start <= self.end
    }
}

pub fn floor_to(t: Ms, unit: Ms) -> Ms {
    t.div_euclid(unit) * unit
}

pub fn ceil_to(t: Ms, unit: Ms) -> Ms {
    let floored = floor_to(t, unit);
    if floored == t { t } else { floored + unit }
}

// ── Wire instants ────────────────────────────────────────────────

/// Parse an ISO-8601 instant. Strings without an offset are taken as UTC.
pub fn parse_instant(text: &str) -> Option<Ms> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc().timestamp_millis())
}

pub fn format_instant(t: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(t)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_else(|| t.to_string())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInstant {
    Millis(i64),
    Text(String),
}

impl RawInstant {
    fn into_ms<E: serde::de::Error>(self) -> Result<Ms, E> {
        match self {
            RawInstant::Millis(ms) => Ok(ms),
            RawInstant::Text(text) => {
                parse_instant(&text).ok_or_else(|| E::custom(format!("invalid instant: {text}")))
            }
        }
    }
}

/// Serde adapter: instants arrive as ISO text or integer millis, leave as ISO text.
pub(crate) mod instant {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Ms, D::Error> {
        RawInstant::deserialize(d)?.into_ms()
    }

    pub fn serialize<S: Serializer>(t: &Ms, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_instant(*t))
    }
}

pub(crate) mod opt_instant {
    use super::*;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Ms>, D::Error> {
        match Option::<RawInstant>::deserialize(d)? {
            Some(raw) => raw.into_ms().map(Some),
            None => Ok(None),
        }
    }

    pub fn serialize<S: Serializer>(t: &Option<Ms>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&format_instant(*t)),
            None => s.serialize_none(),
        }
    }
}

/// `null` on the wire means "clear"; an absent key means "leave alone".
fn present<'de, T: Deserialize<'de>, D: Deserializer<'de>>(d: D) -> Result<Option<T>, D::Error> {
    T::deserialize(d).map(Some)
}

fn null_as_empty<'de, T: Deserialize<'de>, D: Deserializer<'de>>(d: D) -> Result<Vec<T>, D::Error> {
    Ok(Option::<Vec<T>>::deserialize(d)?.unwrap_or_default())
}

// ── Entities ─────────────────────────────────────────────────────

/// Something the entity cache can hold: identified, time-bounded, patchable.
pub trait Entity: Clone + Debug + Send + Sync + 'static {
    type Id: Copy + Eq + Hash + Debug + Send + Sync + 'static;
    type Patch: Clone + Default + Debug + Send + Sync + 'static;

    fn id(&self) -> Self::Id;
    fn start(&self) -> Ms;
    fn end(&self) -> Ms;

    /// Merge every field supplied by `patch`. Returns true if anything changed.
    fn apply(&mut self, patch: &Self::Patch) -> bool;

    /// The current values of exactly the fields `patch` supplies.
    fn snapshot(&self, patch: &Self::Patch) -> Self::Patch;

    /// A patch supplying every field of `self`.
    fn to_patch(&self) -> Self::Patch;
}

fn merge<T: PartialEq + Clone>(slot: &mut T, incoming: &Option<T>) -> bool {
    match incoming {
        Some(value) if slot != value => {
            *slot = value.clone();
            true
        }
        _ => false,
    }
}

fn capture<T: Clone>(slot: &T, supplied: &Option<T>) -> Option<T> {
    supplied.as_ref().map(|_| slot.clone())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "starttime", alias = "start", with = "instant")]
    pub start: Ms,
    #[serde(rename = "endtime", alias = "end", with = "instant")]
    pub end: Ms,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default, rename = "project_mom_id")]
    pub project_id: Option<ProjectId>,
    #[serde(default)]
    pub otdb_id: Option<u64>,
    #[serde(default)]
    pub mom_id: Option<u64>,
    #[serde(default, rename = "mom_object_group_id")]
    pub group_id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub disk_usage: Option<u64>,
    #[serde(default)]
    pub disk_usage_readable: Option<String>,
    #[serde(default)]
    pub ingest_status: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub predecessor_ids: Vec<TaskId>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub successor_ids: Vec<TaskId>,
}

impl Task {
    /// A bare task with only identity and interval set.
    pub fn new(id: TaskId, start: Ms, end: Ms) -> Self {
        Self {
            id,
            start,
            end,
            status: None,
            task_type: None,
            project_id: None,
            otdb_id: None,
            mom_id: None,
            group_id: None,
            name: None,
            project_name: None,
            disk_usage: None,
            disk_usage_readable: None,
            ingest_status: None,
            predecessor_ids: Vec::new(),
            successor_ids: Vec::new(),
        }
    }

    pub fn has_status(&self, status: &str) -> bool {
        self.status.as_deref() == Some(status)
    }
}

/// Partial task update. Outer `None` = not supplied; `Some(None)` = clear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(
        default,
        rename = "starttime",
        alias = "start",
        with = "opt_instant",
        skip_serializing_if = "Option::is_none"
    )]
    pub start: Option<Ms>,
    #[serde(
        default,
        rename = "endtime",
        alias = "end",
        with = "opt_instant",
        skip_serializing_if = "Option::is_none"
    )]
    pub end: Option<Ms>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub status: Option<Option<String>>,
    #[serde(default, rename = "type", deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub task_type: Option<Option<String>>,
    #[serde(default, rename = "project_mom_id", deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Option<ProjectId>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub otdb_id: Option<Option<u64>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub mom_id: Option<Option<u64>>,
    #[serde(default, rename = "mom_object_group_id", deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub group_id: Option<Option<u64>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub name: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub project_name: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub disk_usage: Option<Option<u64>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub disk_usage_readable: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub ingest_status: Option<Option<String>>,
    #[serde(default, deserialize_with = "present_list", skip_serializing_if = "Option::is_none")]
    pub predecessor_ids: Option<Vec<TaskId>>,
    #[serde(default, deserialize_with = "present_list", skip_serializing_if = "Option::is_none")]
    pub successor_ids: Option<Vec<TaskId>>,
}

fn present_list<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<TaskId>>, D::Error> {
    null_as_empty(d).map(Some)
}

impl TaskPatch {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: Some(Some(status.into())),
            ..Self::default()
        }
    }

    pub fn reschedule(start: Ms, end: Ms) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::default()
        }
    }
}

impl Entity for Task {
    type Id = TaskId;
    type Patch = TaskPatch;

    fn id(&self) -> TaskId {
        self.id
    }

    fn start(&self) -> Ms {
        self.start
    }

    fn end(&self) -> Ms {
        self.end
    }

    fn apply(&mut self, p: &TaskPatch) -> bool {
        // `|` not `||`: every field must be visited.
        merge(&mut self.start, &p.start)
            | merge(&mut self.end, &p.end)
            | merge(&mut self.status, &p.status)
            | merge(&mut self.task_type, &p.task_type)
            | merge(&mut self.project_id, &p.project_id)
            | merge(&mut self.otdb_id, &p.otdb_id)
            | merge(&mut self.mom_id, &p.mom_id)
            | merge(&mut self.group_id, &p.group_id)
            | merge(&mut self.name, &p.name)
            | merge(&mut self.project_name, &p.project_name)
            | merge(&mut self.disk_usage, &p.disk_usage)
            | merge(&mut self.disk_usage_readable, &p.disk_usage_readable)
            | merge(&mut self.ingest_status, &p.ingest_status)
            | merge(&mut self.predecessor_ids, &p.predecessor_ids)
            | merge(&mut self.successor_ids, &p.successor_ids)
    }

    fn snapshot(&self, p: &TaskPatch) -> TaskPatch {
        TaskPatch {
            start: capture(&self.start, &p.start),
            end: capture(&self.end, &p.end),
            status: capture(&self.status, &p.status),
            task_type: capture(&self.task_type, &p.task_type),
            project_id: capture(&self.project_id, &p.project_id),
            otdb_id: capture(&self.otdb_id, &p.otdb_id),
            mom_id: capture(&self.mom_id, &p.mom_id),
            group_id: capture(&self.group_id, &p.group_id),
            name: capture(&self.name, &p.name),
            project_name: capture(&self.project_name, &p.project_name),
            disk_usage: capture(&self.disk_usage, &p.disk_usage),
            disk_usage_readable: capture(&self.disk_usage_readable, &p.disk_usage_readable),
            ingest_status: capture(&self.ingest_status, &p.ingest_status),
            predecessor_ids: capture(&self.predecessor_ids, &p.predecessor_ids),
            successor_ids: capture(&self.successor_ids, &p.successor_ids),
        }
    }

    fn to_patch(&self) -> TaskPatch {
        TaskPatch {
            start: Some(self.start),
            end: Some(self.end),
            status: Some(self.status.clone()),
            task_type: Some(self.task_type.clone()),
            project_id: Some(self.project_id),
            otdb_id: Some(self.otdb_id),
            mom_id: Some(self.mom_id),
            group_id: Some(self.group_id),
            name: Some(self.name.clone()),
            project_name: Some(self.project_name.clone()),
            disk_usage: Some(self.disk_usage),
            disk_usage_readable: Some(self.disk_usage_readable.clone()),
            ingest_status: Some(self.ingest_status.clone()),
            predecessor_ids: Some(self.predecessor_ids.clone()),
            successor_ids: Some(self.successor_ids.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub id: ClaimId,
    #[serde(rename = "starttime", alias = "start", with = "instant")]
    pub start: Ms,
    #[serde(rename = "endtime", alias = "end", with = "instant")]
    pub end: Ms,
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub resource_id: Option<ResourceId>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub claim_size: Option<u64>,
}

impl ResourceClaim {
    pub fn new(id: ClaimId, start: Ms, end: Ms) -> Self {
        Self {
            id,
            start,
            end,
            task_id: None,
            resource_id: None,
            status: None,
            claim_size: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimPatch {
    #[serde(default, rename = "starttime", alias = "start", with = "opt_instant", skip_serializing_if = "Option::is_none")]
    pub start: Option<Ms>,
    #[serde(default, rename = "endtime", alias = "end", with = "opt_instant", skip_serializing_if = "Option::is_none")]
    pub end: Option<Ms>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Option<TaskId>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<Option<ResourceId>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub status: Option<Option<String>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub claim_size: Option<Option<u64>>,
}

impl Entity for ResourceClaim {
    type Id = ClaimId;
    type Patch = ClaimPatch;

    fn id(&self) -> ClaimId {
        self.id
    }

    fn start(&self) -> Ms {
        self.start
    }

    fn end(&self) -> Ms {
        self.end
    }

    fn apply(&mut self, p: &ClaimPatch) -> bool {
        merge(&mut self.start, &p.start)
            | merge(&mut self.end, &p.end)
            | merge(&mut self.task_id, &p.task_id)
            | merge(&mut self.resource_id, &p.resource_id)
            | merge(&mut self.status, &p.status)
            | merge(&mut self.claim_size, &p.claim_size)
    }

    fn snapshot(&self, p: &ClaimPatch) -> ClaimPatch {
        ClaimPatch {
            start: capture(&self.start, &p.start),
            end: capture(&self.end, &p.end),
            task_id: capture(&self.task_id, &p.task_id),
            resource_id: capture(&self.resource_id, &p.resource_id),
            status: capture(&self.status, &p.status),
            claim_size: capture(&self.claim_size, &p.claim_size),
        }
    }

    fn to_patch(&self) -> ClaimPatch {
        ClaimPatch {
            start: Some(self.start),
            end: Some(self.end),
            task_id: Some(self.task_id),
            resource_id: Some(self.resource_id),
            status: Some(self.status.clone()),
            claim_size: Some(self.claim_size),
        }
    }
}

/// Alternate ways of addressing a single task in the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Id(TaskId),
    Otdb(u64),
    Mom(u64),
}

impl TaskKey {
    pub fn matches(&self, task: &Task) -> bool {
        match *self {
            TaskKey::Id(id) => task.id == id,
            TaskKey::Otdb(id) => task.otdb_id == Some(id),
            TaskKey::Mom(id) => task.mom_id == Some(id),
        }
    }
}

// ── Ancillary state ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub available_capacity: Option<u64>,
    #[serde(default)]
    pub total_capacity: Option<u64>,
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CapacityChange {
    pub resource_id: ResourceId,
    pub available: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AvailabilityChange {
    pub resource_id: ResourceId,
    #[serde(alias = "available")]
    pub total: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(alias = "value")]
    pub message: String,
    #[serde(with = "instant")]
    pub timestamp: Ms,
}

// ── Change feed ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    #[serde(rename = "task")]
    Task,
    #[serde(rename = "resourceClaim")]
    ResourceClaim,
    #[serde(rename = "resourceCapacity")]
    ResourceCapacity,
    #[serde(rename = "resourceAvailability")]
    ResourceAvailability,
    #[serde(rename = "logevent")]
    LogEvent,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
    Event,
    #[serde(other)]
    Other,
}

/// One entry of the change feed. `value` stays untyped until it is dispatched,
/// so a malformed payload only fails its own record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub change_number: u64,
    pub object_type: ObjectType,
    pub change_type: ChangeType,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default, with = "opt_instant", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Ms>,
}

/// Payload shape shared by every delete and used to locate updates.
#[derive(Debug, Deserialize)]
pub(crate) struct IdOnly {
    pub id: u64,
}

// ── View scope ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Normal,
    /// Project-scoped; `None` until a project is chosen (loads nothing).
    Project(Option<ProjectId>),
}

impl Mode {
    pub fn is_project(&self) -> bool {
        matches!(self, Mode::Project(_))
    }

    /// Buckets grouped into one fetch chunk.
    pub fn chunk_factor(&self) -> u32 {
        if self.is_project() { 4 } else { 1 }
    }

    pub fn accepts_task(&self, task: &Task) -> bool {
        match self {
            Mode::Normal => true,
            Mode::Project(Some(pid)) => task.project_id == Some(*pid),
            Mode::Project(None) => false,
        }
    }
}

/// What a chunk load must fetch, captured when the window was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadScope {
    pub mode: Mode,
    pub track_claims: bool,
}

impl LoadScope {
    /// Claims are never tracked in project mode.
    pub fn tracks_claims(&self) -> bool {
        self.track_claims && !self.mode.is_project()
    }
}

/// Min start / max end over a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub min: Ms,
    pub max: Ms,
}

impl Bounds {
    /// Bounds of an empty collection: min above every instant, max below.
    pub const UNBOUNDED: Bounds = Bounds { min: Ms::MAX, max: Ms::MIN };

    /// True only for the bounds of an empty collection. A single inverted
    /// entity yields `min > max` but is still bounded.
    pub fn is_unbounded(&self) -> bool {
        *self == Bounds::UNBOUNDED
    }

    pub fn of<'a, E: Entity + 'a>(items: impl IntoIterator<Item = &'a E>) -> Bounds {
        Bounds::try_of(items).unwrap_or(Bounds::UNBOUNDED)
    }

    /// `None` when `items` is empty.
    pub fn try_of<'a, E: Entity + 'a>(items: impl IntoIterator<Item = &'a E>) -> Option<Bounds> {
        items.into_iter().fold(None, |b: Option<Bounds>, e| {
            Some(match b {
                Some(b) => Bounds {
                    min: b.min.min(e.start()),
                    max: b.max.max(e.end()),
                },
                None => Bounds { min: e.start(), max: e.end() },
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_retains_is_closed() {
        let w = Span::new(13 * H, 14 * H);
        assert!(w.retains(12 * H, 13 * H)); // touches from
        assert!(w.retains(14 * H, 15 * H)); // touches to
        assert!(!w.retains(11 * H, 13 * H - 1));
        assert!(!w.retains(14 * H + 1, 15 * H));
    }

    #[test]
    fn floor_and_ceil_alignment() {
        assert_eq!(floor_to(10 * H + 5, H), 10 * H);
        assert_eq!(ceil_to(10 * H + 5, H), 11 * H);
        assert_eq!(ceil_to(10 * H, H), 10 * H);
        assert_eq!(floor_to(-1, H), -H);
    }

    #[test]
    fn instants_parse_from_text_and_millis() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": 1,
            "starttime": "2016-01-01T10:00:00",
            "endtime": 1451646000000i64,
        }))
        .unwrap();
        assert_eq!(task.start, 1451642400000);
        assert_eq!(task.end, 1451646000000);
        assert_eq!(parse_instant("2016-01-01T10:00:00Z"), Some(1451642400000));
        assert_eq!(parse_instant("not a date"), None);
        assert_eq!(format_instant(1451642400000), "2016-01-01T10:00:00Z");
    }

    #[test]
    fn null_fields_decode_as_absent() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "id": 1, "start": 0, "end": 10,
            "disk_usage": null, "successor_ids": null,
        }))
        .unwrap();
        assert_eq!(task.disk_usage, None);
        assert!(task.successor_ids.is_empty());
    }

    #[test]
    fn patch_distinguishes_null_from_absent() {
        let patch: TaskPatch = serde_json::from_value(serde_json::json!({
            "id": 3, "status": "scheduled", "disk_usage": null,
        }))
        .unwrap();
        assert_eq!(patch.status, Some(Some("scheduled".into())));
        assert_eq!(patch.disk_usage, Some(None));
        assert_eq!(patch.name, None);
        assert_eq!(patch.start, None);
    }

    #[test]
    fn patch_normalizes_text_instants() {
        let patch: TaskPatch =
            serde_json::from_value(serde_json::json!({"starttime": "2016-01-01T10:00:00Z"})).unwrap();
        let mut task = Task::new(1, 0, 10);
        assert!(task.apply(&patch));
        assert_eq!(task.start, 1451642400000);
    }

    #[test]
    fn apply_only_touches_supplied_fields() {
        let mut task = Task::new(1, 0, 10);
        task.name = Some("obs".into());
        let changed = task.apply(&TaskPatch::status("approved"));
        assert!(changed);
        assert_eq!(task.status.as_deref(), Some("approved"));
        assert_eq!(task.name.as_deref(), Some("obs"));
        assert!(!task.apply(&TaskPatch::status("approved"))); // idempotent
    }

    #[test]
    fn snapshot_captures_only_patch_keys() {
        let mut task = Task::new(1, 0, 10);
        task.status = Some("approved".into());
        task.name = Some("obs".into());
        let snap = task.snapshot(&TaskPatch::status("on_hold"));
        assert_eq!(snap.status, Some(Some("approved".into())));
        assert_eq!(snap.name, None);
        assert_eq!(snap.start, None);
    }

    #[test]
    fn to_patch_reproduces_entity() {
        let mut claim = ResourceClaim::new(7, 5, 50);
        claim.status = Some("claimed".into());
        let mut other = ResourceClaim::new(7, 0, 1);
        other.apply(&claim.to_patch());
        assert_eq!(other, claim);
    }

    #[test]
    fn change_record_unknown_kinds_are_tolerated() {
        let rec: ChangeRecord = serde_json::from_value(serde_json::json!({
            "changeNumber": 4, "objectType": "somethingNew", "changeType": "mutate",
        }))
        .unwrap();
        assert_eq!(rec.object_type, ObjectType::Other);
        assert_eq!(rec.change_type, ChangeType::Other);
        assert_eq!(rec.value, serde_json::Value::Null);
    }

    #[test]
    fn project_mode_scoping() {
        let mut task = Task::new(1, 0, 10);
        task.project_id = Some(42);
        assert!(Mode::Normal.accepts_task(&task));
        assert!(Mode::Project(Some(42)).accepts_task(&task));
        assert!(!Mode::Project(Some(7)).accepts_task(&task));
        assert!(!Mode::Project(None).accepts_task(&task));
        assert_eq!(Mode::Normal.chunk_factor(), 1);
        assert_eq!(Mode::Project(None).chunk_factor(), 4);
        let scope = LoadScope { mode: Mode::Project(Some(1)), track_claims: true };
        assert!(!scope.tracks_claims());
    }

    #[test]
    fn bounds_of_empty_is_unbounded() {
        let none: Vec<Task> = Vec::new();
        assert!(Bounds::of(&none).is_unbounded());
        let tasks = vec![Task::new(1, 5, 10), Task::new(2, 2, 8)];
        assert_eq!(Bounds::of(&tasks), Bounds { min: 2, max: 10 });
    }

    #[test]
    fn bounds_of_single_inverted_task_is_bounded() {
        let inverted = Task::new(1, 5 * H, 2 * H);
        let bounds = Bounds::of(std::iter::once(&inverted));
        assert!(!bounds.is_unbounded());
        assert_eq!(bounds, Bounds { min: 5 * H, max: 2 * H });
        assert_eq!(Bounds::try_of(std::iter::empty::<&Task>()), None);
    }
}
