use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const API_KEY_HEADER: &str = "x-pik-api-key";
pub const API_KEY_PREFIX: &str = "pik_";
pub const API_KEY_HEX_LEN: usize = 48;
pub const SESSION_TOKEN_HEX_LEN: usize = 64;

pub mod event_types {
    pub const IDENTITY_ENROLLED: &str = "identity.enrolled";
    pub const IDENTITY_AUTHENTICATED: &str = "identity.authenticated";
    pub const IDENTITY_PROFILE_UPDATED: &str = "identity.profile_updated";
    pub const IDENTITY_TITLE_EQUIPPED: &str = "identity.title_equipped";
    pub const KEY_REGISTERED: &str = "key.registered";
    pub const KEY_REVOKED: &str = "key.revoked";
    pub const SOURCE_LINK_GRANTED: &str = "source.link_granted";
    pub const SOURCE_LINK_REVOKED: &str = "source.link_revoked";
    pub const SESSION_COMPLETED: &str = "progression.session_completed";
    pub const XP_GRANTED: &str = "progression.xp_granted";
    pub const NODE_COMPLETED: &str = "progression.node_completed";
    pub const TITLE_GRANTED: &str = "progression.title_granted";
    pub const FATE_MARKER: &str = "progression.fate_marker";
    pub const CACHE_GRANTED: &str = "loot.cache_granted";
    pub const CACHE_OPENED: &str = "loot.cache_opened";
    pub const GEAR_EQUIPPED: &str = "gear.equipped";
    pub const GEAR_UNEQUIPPED: &str = "gear.unequipped";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStatus {
    Active,
    Suspended,
    Deleted,
}

impl IdentityStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IdentityStatus::Active => "active",
            IdentityStatus::Suspended => "suspended",
            IdentityStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(IdentityStatus::Active),
            "suspended" => Some(IdentityStatus::Suspended),
            "deleted" => Some(IdentityStatus::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(KeyStatus::Active),
            "revoked" => Some(KeyStatus::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    Registration,
    Authentication,
}

impl ChallengeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeKind::Registration => "registration",
            ChallengeKind::Authentication => "authentication",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "registration" => Some(ChallengeKind::Registration),
            "authentication" => Some(ChallengeKind::Authentication),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Active,
    Suspended,
    Deactivated,
}

impl SourceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceStatus::Active => "active",
            SourceStatus::Suspended => "suspended",
            SourceStatus::Deactivated => "deactivated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SourceStatus::Active),
            "suspended" => Some(SourceStatus::Suspended),
            "deactivated" => Some(SourceStatus::Deactivated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    Active,
    Revoked,
}

impl LinkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkStatus::Active => "active",
            LinkStatus::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    LevelUp,
    BossKill,
    Milestone,
}

impl CacheType {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheType::LevelUp => "level_up",
            CacheType::BossKill => "boss_kill",
            CacheType::Milestone => "milestone",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "level_up" => Some(CacheType::LevelUp),
            "boss_kill" => Some(CacheType::BossKill),
            "milestone" => Some(CacheType::Milestone),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Sealed,
    Opened,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Sealed => "sealed",
            CacheStatus::Opened => "opened",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    Epic,
    Legendary,
}

impl Rarity {
    pub fn as_str(self) -> &'static str {
        match self {
            Rarity::Common => "common",
            Rarity::Uncommon => "uncommon",
            Rarity::Rare => "rare",
            Rarity::Epic => "epic",
            Rarity::Legendary => "legendary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "common" => Some(Rarity::Common),
            "uncommon" => Some(Rarity::Uncommon),
            "rare" => Some(Rarity::Rare),
            "epic" => Some(Rarity::Epic),
            "legendary" => Some(Rarity::Legendary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    XpBoost,
    Title,
    Marker,
    Gear,
}

impl RewardType {
    pub fn as_str(self) -> &'static str {
        match self {
            RewardType::XpBoost => "xp_boost",
            RewardType::Title => "title",
            RewardType::Marker => "marker",
            RewardType::Gear => "gear",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "xp_boost" => Some(RewardType::XpBoost),
            "title" => Some(RewardType::Title),
            "marker" => Some(RewardType::Marker),
            "gear" => Some(RewardType::Gear),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GearSlot {
    Weapon,
    Helm,
    Chest,
    Arms,
    Legs,
    Rune,
}

impl GearSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            GearSlot::Weapon => "weapon",
            GearSlot::Helm => "helm",
            GearSlot::Chest => "chest",
            GearSlot::Arms => "arms",
            GearSlot::Legs => "legs",
            GearSlot::Rune => "rune",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weapon" => Some(GearSlot::Weapon),
            "helm" => Some(GearSlot::Helm),
            "chest" => Some(GearSlot::Chest),
            "arms" => Some(GearSlot::Arms),
            "legs" => Some(GearSlot::Legs),
            "rune" => Some(GearSlot::Rune),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Normal,
    Hard,
}

impl Difficulty {
    pub fn as_str(self) -> &'static str {
        match self {
            Difficulty::Normal => "normal",
            Difficulty::Hard => "hard",
        }
    }
}

/// Projection of one committed ledger row, as published on the event bus and
/// streamed to SSE observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub root_id: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PayloadError {
    pub message: String,
}

impl PayloadError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PayloadError {}

/// Ingest payloads are opaque JSON on the wire; this is the tagged union the
/// engine validates them into. The original object is still stored verbatim
/// in the ledger row.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestPayload {
    SessionCompleted {
        difficulty: Difficulty,
        nodes_completed: u32,
        boss_damage_pct: f64,
    },
    XpGranted {
        xp: f64,
    },
    NodeCompleted {
        node_id: String,
    },
    TitleGranted {
        title_id: String,
    },
    FateMarker {
        marker: String,
    },
}

impl IngestPayload {
    pub fn parse(event_type: &str, payload: &serde_json::Value) -> Result<Self, PayloadError> {
        match event_type {
            event_types::SESSION_COMPLETED => {
                let difficulty = match payload.get("difficulty").and_then(|v| v.as_str()) {
                    Some("normal") | None => Difficulty::Normal,
                    Some("hard") => Difficulty::Hard,
                    Some(other) => {
                        return Err(PayloadError::new(format!(
                            "payload.difficulty must be normal or hard, got `{}`",
                            other
                        )));
                    }
                };

                let nodes_completed = match payload.get("nodes_completed") {
                    None => 0,
                    Some(v) => v.as_u64().ok_or_else(|| {
                        PayloadError::new("payload.nodes_completed must be a non-negative integer")
                    })?,
                };
                let nodes_completed = u32::try_from(nodes_completed)
                    .map_err(|_| PayloadError::new("payload.nodes_completed is out of range"))?;

                let boss_damage_pct = match payload.get("boss_damage_pct") {
                    None => 0.0,
                    Some(v) => v
                        .as_f64()
                        .ok_or_else(|| PayloadError::new("payload.boss_damage_pct must be a number"))?,
                };
                if !boss_damage_pct.is_finite() || !(0.0..=100.0).contains(&boss_damage_pct) {
                    return Err(PayloadError::new(
                        "payload.boss_damage_pct must be between 0 and 100",
                    ));
                }

                Ok(IngestPayload::SessionCompleted {
                    difficulty,
                    nodes_completed,
                    boss_damage_pct,
                })
            }
            event_types::XP_GRANTED => {
                let xp = payload
                    .get("xp")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| PayloadError::new("payload.xp must be a number"))?;
                if !xp.is_finite() || xp < 0.0 {
                    return Err(PayloadError::new("payload.xp must be a non-negative number"));
                }
                Ok(IngestPayload::XpGranted { xp })
            }
            event_types::NODE_COMPLETED => {
                let node_id = required_string(payload, "node_id")?;
                Ok(IngestPayload::NodeCompleted { node_id })
            }
            event_types::TITLE_GRANTED => {
                let title_id = required_string(payload, "title_id")?;
                Ok(IngestPayload::TitleGranted { title_id })
            }
            event_types::FATE_MARKER => {
                let marker = required_string(payload, "marker")?;
                Ok(IngestPayload::FateMarker { marker })
            }
            other => Err(PayloadError::new(format!("unknown event type `{}`", other))),
        }
    }
}

fn required_string(payload: &serde_json::Value, key: &str) -> Result<String, PayloadError> {
    payload
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| PayloadError::new(format!("payload.{} must be a non-empty string", key)))
}

/// Source ids are caller-chosen and must match
/// `^[a-z0-9][a-z0-9-]{2,48}[a-z0-9]$`.
pub fn is_valid_source_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    if !(4..=50).contains(&bytes.len()) {
        return false;
    }
    let edge = |b: u8| matches!(b, b'a'..=b'z' | b'0'..=b'9');
    let mid = |b: u8| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-');
    edge(bytes[0])
        && edge(bytes[bytes.len() - 1])
        && bytes[1..bytes.len() - 1].iter().all(|b| mid(*b))
}

pub fn is_valid_api_key(key: &str) -> bool {
    let Some(rest) = key.strip_prefix(API_KEY_PREFIX) else {
        return false;
    };
    rest.len() == API_KEY_HEX_LEN && rest.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_pattern_accepts_and_rejects() {
        assert!(is_valid_source_id("src-heroes-veritas-01"));
        assert!(is_valid_source_id("ab12"));
        assert!(!is_valid_source_id("abc"));
        assert!(!is_valid_source_id("-abc1"));
        assert!(!is_valid_source_id("abc1-"));
        assert!(!is_valid_source_id("ABC-src"));
        assert!(!is_valid_source_id("src_underscore"));
        let too_long = format!("a{}a", "b".repeat(49));
        assert!(!is_valid_source_id(&too_long));
        let max_len = format!("a{}a", "b".repeat(48));
        assert!(is_valid_source_id(&max_len));
    }

    #[test]
    fn api_key_format_is_pik_plus_48_hex() {
        assert!(is_valid_api_key(&format!("pik_{}", "a1".repeat(24))));
        assert!(!is_valid_api_key(&format!("pik_{}", "a1".repeat(23))));
        assert!(!is_valid_api_key(&format!("hv_{}", "a1".repeat(24))));
        assert!(!is_valid_api_key(&format!("pik_{}", "A1".repeat(24))));
    }

    #[test]
    fn session_completed_payload_parses_with_defaults() {
        let payload = serde_json::json!({});
        let parsed = IngestPayload::parse(event_types::SESSION_COMPLETED, &payload).unwrap();
        assert_eq!(
            parsed,
            IngestPayload::SessionCompleted {
                difficulty: Difficulty::Normal,
                nodes_completed: 0,
                boss_damage_pct: 0.0,
            }
        );
    }

    #[test]
    fn session_completed_payload_rejects_out_of_range_boss_pct() {
        let payload = serde_json::json!({"boss_damage_pct": 140.0});
        let err = IngestPayload::parse(event_types::SESSION_COMPLETED, &payload).unwrap_err();
        assert!(err.message.contains("boss_damage_pct"));
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        let err = IngestPayload::parse("progression.unknown", &serde_json::json!({})).unwrap_err();
        assert!(err.message.contains("unknown event type"));
    }

    #[test]
    fn xp_granted_rejects_negative_and_non_numeric() {
        let err = IngestPayload::parse(event_types::XP_GRANTED, &serde_json::json!({"xp": -5}))
            .unwrap_err();
        assert!(err.message.contains("non-negative"));
        let err = IngestPayload::parse(event_types::XP_GRANTED, &serde_json::json!({"xp": "ten"}))
            .unwrap_err();
        assert!(err.message.contains("number"));
    }

    #[test]
    fn marker_payload_requires_non_empty_marker() {
        let err =
            IngestPayload::parse(event_types::FATE_MARKER, &serde_json::json!({"marker": "  "}))
                .unwrap_err();
        assert!(err.message.contains("marker"));

        let parsed = IngestPayload::parse(
            event_types::FATE_MARKER,
            &serde_json::json!({"marker": "node:veil-gate"}),
        )
        .unwrap();
        assert_eq!(
            parsed,
            IngestPayload::FateMarker {
                marker: "node:veil-gate".to_string()
            }
        );
    }
}
