// ── Tracking domain model ──
//
// Plain data shared by the registry, sessions, and dispatcher. Wire
// payloads are converted into these types at the edge (see `convert`).

pub mod entity;
pub mod sample;
pub mod snapshot;

// ── Re-exports ──────────────────────────────────────────────────────

pub use entity::{EntityId, EntityKey, EntityKind};
pub use sample::{LocationSample, TrackTarget};
pub use snapshot::TrackingSnapshot;
