use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A reusable, ordered definition of automated engagement steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: SequenceStatus,
    pub trigger: TriggerType,
    /// Conditions for automatic triggering; opaque to the engine.
    #[serde(default)]
    pub trigger_conditions: serde_json::Value,
    pub exit_rules: ExitRules,
    pub send_window: SendWindow,
    #[serde(default)]
    pub goal_description: String,
    /// Set once any step has executed; steps are frozen from then on.
    #[serde(default)]
    pub config_locked: bool,
    #[serde(default)]
    pub stats: SequenceStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sequence {
    /// A DRAFT sequence with the platform defaults.
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            status: SequenceStatus::Draft,
            trigger: TriggerType::Manual,
            trigger_conditions: serde_json::json!({}),
            exit_rules: ExitRules::default(),
            send_window: SendWindow::default(),
            goal_description: String::new(),
            config_locked: false,
            stats: SequenceStats::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Lifecycle status of a sequence definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Archived,
}

/// What enrolls contacts into a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    LeadCreated,
    LeadScored,
    TagAdded,
    FormSubmitted,
    CustomEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRules {
    pub on_reply: bool,
    pub on_click: bool,
    pub on_conversion: bool,
    #[serde(default)]
    pub exit_tags: BTreeSet<String>,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self {
            on_reply: true,
            on_click: false,
            on_conversion: true,
            exit_tags: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendWindow {
    pub skip_weekends: bool,
    pub timezone_optimized: bool,
    /// Hour of day (0-23) in the recipient's zone.
    pub optimal_send_hour: u8,
}

impl Default for SendWindow {
    fn default() -> Self {
        Self {
            skip_weekends: true,
            timezone_optimized: true,
            optimal_send_hour: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceStats {
    pub total_enrolled: u64,
    pub total_completed: u64,
    pub total_converted: u64,
}

/// One unit of work within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub sequence_id: Uuid,
    /// Unique, strictly increasing within a sequence.
    pub order: u32,
    pub name: String,
    pub delay: Delay,
    pub day_type: DayType,
    pub kind: StepKind,
    #[serde(default)]
    pub stats: StepStats,
}

impl Step {
    pub fn new(order: u32, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence_id: Uuid::nil(),
            order,
            name: name.into(),
            delay: Delay::default(),
            day_type: DayType::Business,
            kind,
            stats: StepStats::default(),
        }
    }

    pub fn with_delay(mut self, days: u32, hours: u32, day_type: DayType) -> Self {
        self.delay = Delay { days, hours };
        self.day_type = day_type;
        self
    }

    pub fn step_type(&self) -> StepType {
        self.kind.step_type()
    }

    /// Configuration checks applied when a sequence is activated.
    pub fn validate(&self) -> Result<(), String> {
        match &self.kind {
            StepKind::Email(email) => {
                if email.template_id.trim().is_empty() {
                    return Err(format!(
                        "step '{}': email template is required for email steps",
                        self.name
                    ));
                }
                if let Some(variant) = &email.variant {
                    if variant.group.is_empty() || variant.label.is_empty() {
                        return Err(format!("step '{}': incomplete variant reference", self.name));
                    }
                }
            }
            StepKind::Wait => {}
            StepKind::Condition(condition) => condition.predicate.validate(&self.name)?,
            StepKind::Action(action) => action.action.validate(&self.name)?,
            StepKind::AbTest(ab) => {
                if ab.group.trim().is_empty() {
                    return Err(format!("step '{}': A/B group is required", self.name));
                }
                if ab.variants.is_empty() || ab.total_weight() == 0 {
                    return Err(format!(
                        "step '{}': A/B test needs at least one variant with positive weight",
                        self.name
                    ));
                }
                let labels: BTreeSet<&str> = ab.variants.iter().map(|v| v.label.as_str()).collect();
                if labels.len() != ab.variants.len() {
                    return Err(format!("step '{}': duplicate variant labels", self.name));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    pub days: u32,
    pub hours: u32,
}

impl Delay {
    /// Display-only estimate: business days are stretched by 7/5.
    ///
    /// This intentionally diverges from the day-by-day arithmetic the
    /// scheduler uses for real fire times; reports built on it depend on the
    /// approximation staying as is.
    pub fn approximate_hours(&self, day_type: DayType) -> f64 {
        let days = match day_type {
            DayType::Business => self.days as f64 * 7.0 / 5.0,
            DayType::Calendar => self.days as f64,
        };
        days * 24.0 + self.hours as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayType {
    Calendar,
    Business,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStats {
    pub total_sent: u64,
    pub total_opened: u64,
    pub total_clicked: u64,
    pub total_replied: u64,
}

/// Step configuration, one concrete shape per step type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepKind {
    Email(EmailStep),
    Wait,
    Condition(ConditionStep),
    Action(ActionStep),
    AbTest(AbTestStep),
}

impl StepKind {
    pub fn step_type(&self) -> StepType {
        match self {
            StepKind::Email(_) => StepType::Email,
            StepKind::Wait => StepType::Wait,
            StepKind::Condition(_) => StepType::Condition,
            StepKind::Action(_) => StepType::Action,
            StepKind::AbTest(_) => StepType::AbTest,
        }
    }
}

/// Discriminant used to look up the registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Email,
    Wait,
    Condition,
    Action,
    AbTest,
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StepType::Email => "email",
            StepType::Wait => "wait",
            StepType::Condition => "condition",
            StepType::Action => "action",
            StepType::AbTest => "ab_test",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailStep {
    pub template_id: String,
    #[serde(default)]
    pub subject_override: Option<String>,
    /// Only send to enrollments assigned to this A/B variant.
    #[serde(default)]
    pub variant: Option<VariantRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantRef {
    pub group: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    pub predicate: Predicate,
}

/// Named predicates a CONDITION step can evaluate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "name")]
pub enum Predicate {
    HasTag {
        tag: String,
    },
    /// Lead score at or above `threshold`.
    ScoreAbove {
        threshold: i64,
    },
    HasOpened,
    HasClicked,
    Custom {
        key: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

impl Predicate {
    pub fn name(&self) -> &str {
        match self {
            Predicate::HasTag { .. } => "has_tag",
            Predicate::ScoreAbove { .. } => "score_above",
            Predicate::HasOpened => "has_opened",
            Predicate::HasClicked => "has_clicked",
            Predicate::Custom { key, .. } => key,
        }
    }

    fn validate(&self, step_name: &str) -> Result<(), String> {
        match self {
            Predicate::HasTag { tag } if tag.trim().is_empty() => {
                Err(format!("step '{}': has_tag needs a tag", step_name))
            }
            Predicate::Custom { key, .. } if key.trim().is_empty() => {
                Err(format!("step '{}': custom condition needs a key", step_name))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionStep {
    pub action: StepAction,
}

/// Side-effecting mutations an ACTION step performs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "name")]
pub enum StepAction {
    AddTag {
        tag: String,
    },
    AdjustScore {
        delta: i64,
    },
    AssignOwner {
        owner_id: Uuid,
    },
    CreateTask {
        subject: String,
        #[serde(default)]
        notes: String,
        #[serde(default = "default_due_days")]
        due_days: u32,
    },
    Webhook {
        url: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

fn default_due_days() -> u32 {
    1
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            StepAction::AddTag { .. } => "add_tag",
            StepAction::AdjustScore { .. } => "adjust_score",
            StepAction::AssignOwner { .. } => "assign_owner",
            StepAction::CreateTask { .. } => "create_task",
            StepAction::Webhook { .. } => "webhook",
        }
    }

    fn validate(&self, step_name: &str) -> Result<(), String> {
        match self {
            StepAction::AddTag { tag } if tag.trim().is_empty() => {
                Err(format!("step '{}': add_tag needs a tag", step_name))
            }
            StepAction::Webhook { url, .. } if url.trim().is_empty() => {
                Err(format!("step '{}': webhook needs a url", step_name))
            }
            StepAction::CreateTask { subject, .. } if subject.trim().is_empty() => {
                Err(format!("step '{}': create_task needs a subject", step_name))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestStep {
    pub group: String,
    pub variants: Vec<Variant>,
}

impl AbTestStep {
    /// Summed in `u64` so any number of `u32` weights fits.
    pub fn total_weight(&self) -> u64 {
        self.variants.iter().map(|v| u64::from(v.weight)).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variant {
    pub label: String,
    /// Relative weight (percentages in practice).
    pub weight: u32,
}

/// One contact's stateful progress through a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: Uuid,
    pub status: EnrollmentStatus,
    pub current_step_id: Option<Uuid>,
    pub current_step_order: Option<u32>,
    /// Position of the current step in the ordered step list. Never decreases.
    pub current_step_index: u32,
    /// Only set while the enrollment is ACTIVE.
    pub next_fire_at: Option<DateTime<Utc>>,
    pub exit: Option<ExitRecord>,
    pub conversion: Option<Conversion>,
    pub context: EnrollmentContext,
    pub custom_variables: HashMap<String, serde_json::Value>,
    /// A/B group -> chosen variant label; stable once written.
    pub variant_assignments: HashMap<String, String>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn is_converted(&self) -> bool {
        self.conversion.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Exited,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Completed,
    Replied,
    Clicked,
    Converted,
    Unsubscribed,
    Manual,
    ConditionMet,
    Error,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::Replied => "replied",
            ExitReason::Clicked => "clicked",
            ExitReason::Converted => "converted",
            ExitReason::Unsubscribed => "unsubscribed",
            ExitReason::Manual => "manual",
            ExitReason::ConditionMet => "condition_met",
            ExitReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitRecord {
    pub reason: ExitReason,
    pub details: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversion {
    pub at: DateTime<Utc>,
    pub value: Option<Decimal>,
}

/// Snapshot of how and when the contact was enrolled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollmentContext {
    pub enrolled_by: String,
    pub method: String,
    pub enrolled_at: DateTime<Utc>,
}

/// One timestamped attempt to run a step for one enrollment. A new row is
/// written for every firing, including retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub sequence_id: Uuid,
    pub step_id: Uuid,
    /// 1 for the first firing of a step, incremented per retry.
    pub attempt: u32,
    pub status: ExecutionStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub result: serde_json::Value,
    pub error: Option<String>,
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Scheduled,
    Executing,
    Completed,
    Failed,
    Skipped,
}
