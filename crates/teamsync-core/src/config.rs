use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use racing_api::{BudgetLimit, ClientConfig, OperationCategory};
use serde::{Deserialize, Serialize};

use crate::coordinator::{CoordinatorOptions, PhaseCooldowns};
use crate::error::{Result, SyncError};
use crate::paths;
use crate::queue::{QueueOptions, Tier};
use crate::schedule::{ScheduleConfig, ScheduleValidator};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// ApiConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_club_id")]
    pub club_id: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_throttle_fallback")]
    pub throttle_fallback_secs: u64,
}

fn default_base_url() -> String {
    "https://zwift-ranking.herokuapp.com".to_string()
}

fn default_api_key_env() -> String {
    "ZWIFT_API_KEY".to_string()
}

fn default_club_id() -> u64 {
    11818
}

fn default_request_timeout() -> u64 {
    15
}

fn default_throttle_fallback() -> u64 {
    120
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            club_id: default_club_id(),
            request_timeout_secs: default_request_timeout(),
            throttle_fallback_secs: default_throttle_fallback(),
        }
    }
}

impl ApiConfig {
    /// The key from the configured environment variable, if set and non-blank.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default)]
    pub inter_item_delay_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retention() -> u64 {
    600
}

fn default_event_capacity() -> usize {
    256
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retention_secs: default_retention(),
            inter_item_delay_ms: 0,
            event_capacity: default_event_capacity(),
        }
    }
}

// ---------------------------------------------------------------------------
// CoordinatorConfig
// ---------------------------------------------------------------------------

/// Manual trigger cooldowns, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownConfig {
    #[serde(default = "default_riders_cooldown")]
    pub riders_secs: u64,
    #[serde(default = "default_events_cooldown")]
    pub events_secs: u64,
    #[serde(default = "default_results_cooldown")]
    pub results_secs: u64,
}

fn default_riders_cooldown() -> u64 {
    300
}

fn default_events_cooldown() -> u64 {
    120
}

fn default_results_cooldown() -> u64 {
    600
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            riders_secs: default_riders_cooldown(),
            events_secs: default_events_cooldown(),
            results_secs: default_results_cooldown(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_results_days_back")]
    pub results_days_back: u32,
    #[serde(default = "default_recent_run_threshold")]
    pub recent_run_threshold_minutes: u64,
    #[serde(default = "default_near_event_hours")]
    pub near_event_hours: u32,
    #[serde(default = "default_riders_tier")]
    pub riders_tier: Tier,
    #[serde(default = "default_near_event_tier")]
    pub near_event_tier: Tier,
    #[serde(default = "default_far_event_tier")]
    pub far_event_tier: Tier,
    #[serde(default = "default_results_tier")]
    pub results_tier: Tier,
    #[serde(default)]
    pub cooldowns: CooldownConfig,
    #[serde(default = "default_adhoc_attempts")]
    pub adhoc_attempts: u32,
    #[serde(default = "default_adhoc_backoff")]
    pub adhoc_backoff_secs: u64,
}

fn default_results_days_back() -> u32 {
    7
}

fn default_recent_run_threshold() -> u64 {
    30
}

fn default_near_event_hours() -> u32 {
    24
}

fn default_riders_tier() -> Tier {
    2
}

fn default_near_event_tier() -> Tier {
    1
}

fn default_far_event_tier() -> Tier {
    3
}

fn default_results_tier() -> Tier {
    2
}

fn default_adhoc_attempts() -> u32 {
    3
}

fn default_adhoc_backoff() -> u64 {
    5
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            results_days_back: default_results_days_back(),
            recent_run_threshold_minutes: default_recent_run_threshold(),
            near_event_hours: default_near_event_hours(),
            riders_tier: default_riders_tier(),
            near_event_tier: default_near_event_tier(),
            far_event_tier: default_far_event_tier(),
            results_tier: default_results_tier(),
            cooldowns: CooldownConfig::default(),
            adhoc_attempts: default_adhoc_attempts(),
            adhoc_backoff_secs: default_adhoc_backoff(),
        }
    }
}

// ---------------------------------------------------------------------------
// SyncConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub api: ApiConfig,
    /// Per-category overrides of the documented rate ceilings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub budgets: BTreeMap<OperationCategory, BudgetLimit>,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            api: ApiConfig::default(),
            budgets: BTreeMap::new(),
            queue: QueueConfig::default(),
            schedule: ScheduleConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(SyncError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: SyncConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Derived component settings
    // -----------------------------------------------------------------------

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_secs(self.api.request_timeout_secs),
            throttle_fallback: Duration::from_secs(self.api.throttle_fallback_secs),
            limits: self.budgets.iter().map(|(c, l)| (*c, *l)).collect(),
        }
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            max_retries: self.queue.max_retries,
            retention: Duration::from_secs(self.queue.retention_secs),
            inter_item_delay: Duration::from_millis(self.queue.inter_item_delay_ms),
            event_capacity: self.queue.event_capacity,
        }
    }

    pub fn coordinator_options(&self) -> CoordinatorOptions {
        let c = &self.coordinator;
        CoordinatorOptions {
            club_id: self.api.club_id,
            lookforward_hours: self.schedule.lookforward_hours,
            near_event_threshold_minutes: self.schedule.near_event_threshold_minutes,
            results_days_back: c.results_days_back,
            recent_run_threshold: Duration::from_secs(c.recent_run_threshold_minutes * 60),
            near_event_hours: c.near_event_hours,
            peak: self.schedule.peak,
            riders_tier: c.riders_tier,
            near_event_tier: c.near_event_tier,
            far_event_tier: c.far_event_tier,
            results_tier: c.results_tier,
            cooldowns: PhaseCooldowns {
                riders: Duration::from_secs(c.cooldowns.riders_secs),
                events: Duration::from_secs(c.cooldowns.events_secs),
                results: Duration::from_secs(c.cooldowns.results_secs),
            },
            adhoc_attempts: c.adhoc_attempts,
            adhoc_backoff: Duration::from_secs(c.adhoc_backoff_secs),
        }
    }

    /// Validator that knows about the configured budget overrides.
    pub fn validator(&self) -> ScheduleValidator {
        ScheduleValidator::new(self.client_config().limits)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.api.base_url.trim().is_empty() {
            warnings.push(ConfigWarning::error("api.base_url is empty"));
        }
        if self.api.club_id == 0 {
            warnings.push(ConfigWarning::error("api.club_id is not set"));
        }
        if self.api.request_timeout_secs == 0 {
            warnings.push(ConfigWarning::error("api.request_timeout_secs must be positive"));
        }
        if self.api.api_key().is_none() {
            warnings.push(ConfigWarning::warning(format!(
                "environment variable {} is not set; requests will be unauthenticated",
                self.api.api_key_env
            )));
        }

        for (category, limit) in &self.budgets {
            if limit.max_calls == 0 || limit.window_secs == 0 {
                warnings.push(ConfigWarning::error(format!(
                    "budgets.{category} needs a positive window_secs and max_calls"
                )));
            }
        }

        if self.queue.max_retries == 0 {
            warnings.push(ConfigWarning::warning(
                "queue.max_retries is 0; transient failures will not be retried",
            ));
        }
        if self.queue.event_capacity == 0 {
            warnings.push(ConfigWarning::error("queue.event_capacity must be positive"));
        }

        let c = &self.coordinator;
        if c.near_event_tier > c.far_event_tier {
            warnings.push(ConfigWarning::warning(format!(
                "near events (tier {}) are queued behind far events (tier {})",
                c.near_event_tier, c.far_event_tier
            )));
        }
        if c.adhoc_attempts == 0 {
            warnings.push(ConfigWarning::error("coordinator.adhoc_attempts must be at least 1"));
        }

        let report = self.validator().validate(&self.schedule);
        warnings.extend(report.errors.into_iter().map(ConfigWarning::error));
        warnings.extend(report.warnings.into_iter().map(ConfigWarning::warning));

        warnings
    }

    /// `true` when no entry is an error.
    pub fn is_valid(&self) -> bool {
        self.validate()
            .iter()
            .all(|w| w.level != WarnLevel::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::{ScheduleTrigger, TriggerAction};
    use tempfile::TempDir;

    #[test]
    fn default_config_roundtrip() {
        let cfg = SyncConfig::new();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: SyncConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, cfg);
        assert_eq!(parsed.version, 1);
        assert!(!yaml.contains("budgets"));
    }

    #[test]
    fn missing_sections_take_defaults() {
        let cfg: SyncConfig = serde_yaml::from_str("api:\n  club_id: 42\nqueue:\n  max_retries: 5\n").unwrap();
        assert_eq!(cfg.api.club_id, 42);
        assert_eq!(cfg.api.request_timeout_secs, 15);
        assert_eq!(cfg.queue.max_retries, 5);
        assert_eq!(cfg.queue.retention_secs, 600);
        assert_eq!(cfg.coordinator.far_event_tier, 3);
        assert_eq!(cfg.schedule.triggers.len(), 3);
    }

    #[test]
    fn budget_overrides_reach_client_and_validator() {
        let yaml = "budgets:\n  club_members:\n    window_secs: 900\n    max_calls: 1\n";
        let cfg: SyncConfig = serde_yaml::from_str(yaml).unwrap();
        let client = cfg.client_config();
        assert_eq!(
            client.limit_for(OperationCategory::ClubMembers),
            BudgetLimit::new(900, 1)
        );
        assert_eq!(cfg.validator().minimum_interval(TriggerAction::Riders), 15);
    }

    #[test]
    fn load_without_init_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SyncConfig::load(dir.path()),
            Err(SyncError::NotInitialized)
        ));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = SyncConfig::new();
        cfg.api.club_id = 7;
        cfg.save(dir.path()).unwrap();
        assert_eq!(SyncConfig::load(dir.path()).unwrap(), cfg);
    }

    #[test]
    fn schedule_errors_surface_in_validate() {
        let mut cfg = SyncConfig::new();
        cfg.schedule.triggers = vec![
            ScheduleTrigger::new("events", TriggerAction::Events, 15),
            ScheduleTrigger::new("results", TriggerAction::Results, 180),
        ];
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("both fire")));
        assert!(!cfg.is_valid());
    }

    #[test]
    fn zero_club_and_inverted_tiers_are_reported() {
        let mut cfg = SyncConfig::new();
        cfg.api.club_id = 0;
        cfg.coordinator.near_event_tier = 5;
        let warnings = cfg.validate();
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Error && w.message.contains("club_id")));
        assert!(warnings
            .iter()
            .any(|w| w.level == WarnLevel::Warning && w.message.contains("queued behind")));
    }

    #[test]
    fn coordinator_options_pull_from_schedule_and_api() {
        let mut cfg = SyncConfig::new();
        cfg.api.club_id = 99;
        cfg.schedule.lookforward_hours = 12;
        cfg.coordinator.cooldowns.events_secs = 30;
        let opts = cfg.coordinator_options();
        assert_eq!(opts.club_id, 99);
        assert_eq!(opts.lookforward_hours, 12);
        assert_eq!(opts.cooldowns.events, Duration::from_secs(30));
        assert_eq!(opts.recent_run_threshold, Duration::from_secs(30 * 60));
    }
}
