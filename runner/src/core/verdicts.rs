//! Typed verdict envelopes emitted by validator agents.
//!
//! Each envelope kind is a plain record with a fixed marker. Extraction is
//! lenient: only fields with the expected JSON type are copied, everything else
//! keeps its zero value. An object that carries neither the marker key nor any
//! recognized field is treated as no signal.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::envelope::{EnvelopeError, extract_object};

/// A verdict record that can be located by its marker.
pub trait Envelope: Sized {
    const MARKER: &'static str;

    /// Build the record from the envelope body.
    fn from_fields(fields: &mut Fields<'_>) -> Self;
}

/// Extract the envelope `E` from agent output.
///
/// `Ok(None)` means the agent produced no verdict; `Err` means it tried and
/// produced malformed JSON.
pub fn extract<E: Envelope>(text: &str) -> Result<Option<E>, EnvelopeError> {
    let Some(raw) = extract_object(text, E::MARKER)? else {
        return Ok(None);
    };
    let (body, has_marker) = match raw.get(E::MARKER) {
        Some(Value::Object(nested)) => (nested, true),
        _ => (&raw, false),
    };
    let mut fields = Fields::new(body);
    let envelope = E::from_fields(&mut fields);
    if !fields.recognized && !has_marker {
        return Ok(None);
    }
    Ok(Some(envelope))
}

/// Typed accessor over an envelope body that remembers whether anything matched.
pub struct Fields<'a> {
    map: &'a Map<String, Value>,
    recognized: bool,
}

impl<'a> Fields<'a> {
    fn new(map: &'a Map<String, Value>) -> Self {
        Self {
            map,
            recognized: false,
        }
    }

    fn hit<T>(&mut self, value: Option<T>) -> Option<T> {
        if value.is_some() {
            self.recognized = true;
        }
        value
    }

    pub fn string(&mut self, key: &str) -> String {
        let value = self.map.get(key).and_then(Value::as_str).map(str::to_string);
        self.hit(value).unwrap_or_default()
    }

    pub fn count(&mut self, key: &str) -> u32 {
        // `as` saturates, so negative or huge numbers clamp instead of wrapping.
        let value = self.map.get(key).and_then(Value::as_f64).map(|n| n as u32);
        self.hit(value).unwrap_or_default()
    }

    pub fn strings(&mut self, key: &str) -> Vec<String> {
        let value = self.map.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        });
        self.hit(value).unwrap_or_default()
    }

    pub fn records<T>(&mut self, key: &str, build: fn(&Map<String, Value>) -> T) -> Vec<T> {
        let value = self.map.get(key).and_then(Value::as_array).map(|items| {
            items
                .iter()
                .filter_map(Value::as_object)
                .map(build)
                .collect()
        });
        self.hit(value).unwrap_or_default()
    }
}

fn is_empty_str(value: &str) -> bool {
    value.is_empty()
}

/// `RALPH_VALIDATION`: the main validator's judgement of an implementation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub verdict: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub feedback: String,
    pub remaining: u32,
    pub blocked_count: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub blocked_tasks: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStatus {
    Approved,
    NeedsMoreWork,
    Rejected,
    Inadmissible,
    Escalate,
    Blocked,
    Unknown,
}

impl ValidationVerdict {
    pub fn status(&self) -> ValidationStatus {
        match normalize(&self.verdict).as_str() {
            "APPROVED" | "COMPLETE" => ValidationStatus::Approved,
            "NEEDS_MORE_WORK" => ValidationStatus::NeedsMoreWork,
            "REJECTED" => ValidationStatus::Rejected,
            "INADMISSIBLE" => ValidationStatus::Inadmissible,
            "ESCALATE" => ValidationStatus::Escalate,
            "BLOCKED" => ValidationStatus::Blocked,
            _ => ValidationStatus::Unknown,
        }
    }
}

impl Envelope for ValidationVerdict {
    const MARKER: &'static str = "RALPH_VALIDATION";

    fn from_fields(fields: &mut Fields<'_>) -> Self {
        Self {
            verdict: fields.string("verdict"),
            feedback: fields.string("feedback"),
            remaining: fields.count("remaining"),
            blocked_count: fields.count("blocked_count"),
            blocked_tasks: fields.strings("blocked_tasks"),
        }
    }
}

/// Evidence quoted by the cross-validator for one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeQuote {
    pub file: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub production_calls: Vec<String>,
}

impl CodeQuote {
    fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            file: string_field(map, "file"),
            imports: string_or_list(map, "imports"),
            production_calls: string_or_list(map, "production_calls"),
        }
    }
}

/// A task whose claimed completion did not match the code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Discrepancy {
    pub task_id: String,
    pub claimed: String,
    pub actual: String,
}

impl Discrepancy {
    fn from_map(map: &Map<String, Value>) -> Self {
        Self {
            task_id: string_field(map, "task_id"),
            claimed: string_field(map, "claimed"),
            actual: string_field(map, "actual"),
        }
    }
}

/// `RALPH_CROSS_VALIDATION`: a second opinion on an approved pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrossValidationVerdict {
    pub verdict: String,
    pub tasks_verified: u32,
    pub discrepancies_found: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files_actually_read: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub code_quotes: Vec<CodeQuote>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub discrepancies: Vec<Discrepancy>,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub feedback: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossStatus {
    Confirmed,
    Rejected,
    Unknown,
}

impl CrossValidationVerdict {
    pub fn status(&self) -> CrossStatus {
        match normalize(&self.verdict).as_str() {
            "CONFIRMED" => CrossStatus::Confirmed,
            "REJECTED" => CrossStatus::Rejected,
            _ => CrossStatus::Unknown,
        }
    }

    /// Feedback for the next implementation pass, listing each discrepancy.
    pub fn rejection_feedback(&self) -> String {
        let mut out = if self.feedback.trim().is_empty() {
            "Cross-validation rejected the completion claim.".to_string()
        } else {
            self.feedback.trim().to_string()
        };
        for discrepancy in &self.discrepancies {
            out.push_str(&format!(
                "\n- {}: claimed {}; actual {}",
                discrepancy.task_id, discrepancy.claimed, discrepancy.actual
            ));
        }
        out
    }
}

impl Envelope for CrossValidationVerdict {
    const MARKER: &'static str = "RALPH_CROSS_VALIDATION";

    fn from_fields(fields: &mut Fields<'_>) -> Self {
        Self {
            verdict: fields.string("verdict"),
            tasks_verified: fields.count("tasks_verified"),
            discrepancies_found: fields.count("discrepancies_found"),
            files_actually_read: fields.strings("files_actually_read"),
            code_quotes: fields.records("code_quotes", CodeQuote::from_map),
            discrepancies: fields.records("discrepancies", Discrepancy::from_map),
            feedback: fields.string("feedback"),
        }
    }
}

/// `RALPH_TASKS_VALIDATION`: whether the task list faithfully covers the plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TasksValidationVerdict {
    pub verdict: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub feedback: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_requirements: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub out_of_scope_tasks: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub vague_tasks: Vec<String>,
    /// Free-form rating such as `8/10 - solid`.
    #[serde(skip_serializing_if = "is_empty_str")]
    pub quality_score: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TasksStatus {
    Valid,
    Invalid,
    Unknown,
}

impl TasksValidationVerdict {
    pub fn status(&self) -> TasksStatus {
        match normalize(&self.verdict).as_str() {
            "VALID" => TasksStatus::Valid,
            "INVALID" => TasksStatus::Invalid,
            _ => TasksStatus::Unknown,
        }
    }
}

impl Envelope for TasksValidationVerdict {
    const MARKER: &'static str = "RALPH_TASKS_VALIDATION";

    fn from_fields(fields: &mut Fields<'_>) -> Self {
        Self {
            verdict: fields.string("verdict"),
            feedback: fields.string("feedback"),
            missing_requirements: fields.strings("missing_requirements"),
            out_of_scope_tasks: fields.strings("out_of_scope_tasks"),
            vague_tasks: fields.strings("vague_tasks"),
            quality_score: fields.string("quality_score"),
        }
    }
}

/// `RALPH_FINAL_PLAN_VALIDATION`: whether the plan as a whole is implementable.
///
/// Agents may answer `APPROVE`/`REJECT`; those are stored as
/// `CONFIRMED`/`NOT_IMPLEMENTED`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FinalPlanVerdict {
    pub verdict: String,
    #[serde(skip_serializing_if = "is_empty_str")]
    pub feedback: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalPlanStatus {
    Confirmed,
    NotImplemented,
    Unknown,
}

impl FinalPlanVerdict {
    pub fn status(&self) -> FinalPlanStatus {
        match normalize(&self.verdict).as_str() {
            "CONFIRMED" => FinalPlanStatus::Confirmed,
            "NOT_IMPLEMENTED" => FinalPlanStatus::NotImplemented,
            _ => FinalPlanStatus::Unknown,
        }
    }
}

impl Envelope for FinalPlanVerdict {
    const MARKER: &'static str = "RALPH_FINAL_PLAN_VALIDATION";

    fn from_fields(fields: &mut Fields<'_>) -> Self {
        let verdict = fields.string("verdict");
        let verdict = match normalize(&verdict).as_str() {
            "APPROVE" => "CONFIRMED".to_string(),
            "REJECT" => "NOT_IMPLEMENTED".to_string(),
            _ => verdict,
        };
        Self {
            verdict,
            feedback: fields.string("feedback"),
        }
    }
}

fn normalize(verdict: &str) -> String {
    verdict.trim().to_ascii_uppercase()
}

fn string_field(map: &Map<String, Value>, key: &str) -> String {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default()
}

fn string_or_list(map: &Map<String, Value>, key: &str) -> Vec<String> {
    match map.get(key) {
        Some(Value::String(single)) => vec![single.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
