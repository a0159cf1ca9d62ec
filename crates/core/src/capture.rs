use chrono::{Local, NaiveDate};
use serde_json::Value;

use crate::error::ValidationIssue;
use crate::model::Priority;
use crate::parser::{normalize_text, parse_due_date, parse_points, points_from_i64};
use crate::store::{server_timestamp, FieldMap};

pub const DEFAULT_POINTS: u32 = 100;
pub const TITLE_MAX_CHARS: usize = 50;

/// Points as typed into a form or passed programmatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointsInput {
    Number(i64),
    Text(String),
}

impl PointsInput {
    pub fn resolve(&self) -> Result<u32, ValidationIssue> {
        match self {
            PointsInput::Number(value) => points_from_i64(*value),
            PointsInput::Text(raw) => parse_points(raw),
        }
    }
}

impl From<i64> for PointsInput {
    fn from(value: i64) -> Self {
        PointsInput::Number(value)
    }
}

impl From<u32> for PointsInput {
    fn from(value: u32) -> Self {
        PointsInput::Number(value.into())
    }
}

impl From<&str> for PointsInput {
    fn from(value: &str) -> Self {
        PointsInput::Text(value.to_string())
    }
}

impl From<String> for PointsInput {
    fn from(value: String) -> Self {
        PointsInput::Text(value)
    }
}

/// Input for creating a task from any client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDraft {
    pub title: String,
    pub description: Option<String>,
    pub points: Option<PointsInput>,
    pub due_date: Option<String>,
    pub category: Option<String>,
    pub priority: Option<Priority>,
    pub image_uri: Option<String>,
}

impl TaskDraft {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn points(mut self, points: impl Into<PointsInput>) -> Self {
        self.points = Some(points.into());
        self
    }

    pub fn due_date(mut self, spec: impl Into<String>) -> Self {
        self.due_date = Some(spec.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn image_uri(mut self, uri: impl Into<String>) -> Self {
        self.image_uri = Some(uri.into());
        self
    }

    pub fn validate(&self) -> Result<ValidTask, ValidationIssue> {
        self.validate_on(Local::now().date_naive())
    }

    /// Validate against an explicit calendar day for relative due dates.
    pub fn validate_on(&self, today: NaiveDate) -> Result<ValidTask, ValidationIssue> {
        let title = validate_title(&self.title)?;
        let points = match &self.points {
            Some(points) => points.resolve()?,
            None => DEFAULT_POINTS,
        };
        let due_date = normalize_text(self.due_date.as_deref())
            .map(|spec| parse_due_date(&spec, today))
            .transpose()?;

        Ok(ValidTask {
            title,
            description: normalize_text(self.description.as_deref()),
            points,
            due_date,
            category: normalize_text(self.category.as_deref()),
            priority: self.priority,
            image_uri: normalize_text(self.image_uri.as_deref()),
        })
    }
}

/// A draft that passed validation and can be written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTask {
    pub title: String,
    pub description: Option<String>,
    pub points: u32,
    pub due_date: Option<NaiveDate>,
    pub category: Option<String>,
    pub priority: Option<Priority>,
    pub image_uri: Option<String>,
}

impl ValidTask {
    /// Field map for a new record. `createdAt` is left to the store clock.
    pub fn to_fields(&self) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert("title".into(), Value::from(self.title.as_str()));
        fields.insert("points".into(), Value::from(self.points));
        fields.insert("completed".into(), Value::Bool(false));
        fields.insert("completedAt".into(), Value::Null);
        fields.insert("createdAt".into(), server_timestamp());
        insert_opt(&mut fields, "description", self.description.as_deref());
        insert_opt(
            &mut fields,
            "dueDate",
            self.due_date.map(|d| d.format("%Y-%m-%d").to_string()).as_deref(),
        );
        insert_opt(&mut fields, "category", self.category.as_deref());
        insert_opt(&mut fields, "priority", self.priority.map(|p| p.as_str()));
        insert_opt(&mut fields, "imageUri", self.image_uri.as_deref());
        fields
    }
}

/// Edit form. Unset fields are left untouched; a blank text field clears it.
///
/// Identity, creation time and completion state are not editable here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub points: Option<PointsInput>,
    pub due_date: Option<String>,
    pub category: Option<String>,
    pub priority: Option<Priority>,
    pub image_uri: Option<String>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self == &TaskPatch::default()
    }

    pub fn validate(&self) -> Result<FieldMap, ValidationIssue> {
        self.validate_on(Local::now().date_naive())
    }

    pub fn validate_on(&self, today: NaiveDate) -> Result<FieldMap, ValidationIssue> {
        let mut fields = FieldMap::new();
        if let Some(title) = &self.title {
            fields.insert("title".into(), Value::from(validate_title(title)?));
        }
        if let Some(points) = &self.points {
            fields.insert("points".into(), Value::from(points.resolve()?));
        }
        if let Some(spec) = &self.due_date {
            let due = normalize_text(Some(spec.as_str()))
                .map(|spec| parse_due_date(&spec, today))
                .transpose()?;
            fields.insert(
                "dueDate".into(),
                due.map(|d| Value::from(d.format("%Y-%m-%d").to_string()))
                    .unwrap_or(Value::Null),
            );
        }
        if let Some(priority) = self.priority {
            fields.insert("priority".into(), Value::from(priority.as_str()));
        }
        for (name, value) in [
            ("description", &self.description),
            ("category", &self.category),
            ("imageUri", &self.image_uri),
        ] {
            if let Some(value) = value {
                fields.insert(
                    name.into(),
                    normalize_text(Some(value.as_str()))
                        .map(Value::from)
                        .unwrap_or(Value::Null),
                );
            }
        }
        Ok(fields)
    }
}

fn validate_title(raw: &str) -> Result<String, ValidationIssue> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ValidationIssue::EmptyTitle);
    }
    if title.chars().count() > TITLE_MAX_CHARS {
        return Err(ValidationIssue::TitleTooLong {
            max: TITLE_MAX_CHARS,
        });
    }
    Ok(title.to_string())
}

fn insert_opt(fields: &mut FieldMap, name: &str, value: Option<&str>) {
    if let Some(value) = value {
        fields.insert(name.into(), Value::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::is_server_timestamp;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 5).unwrap()
    }

    #[test]
    fn draft_defaults_points_and_stamps_server_time() {
        let valid = TaskDraft::new("  Water plants ").validate_on(today()).unwrap();
        assert_eq!(valid.title, "Water plants");
        assert_eq!(valid.points, DEFAULT_POINTS);

        let fields = valid.to_fields();
        assert_eq!(fields["completed"], json!(false));
        assert_eq!(fields["completedAt"], Value::Null);
        assert!(is_server_timestamp(&fields["createdAt"]));
        assert!(!fields.contains_key("description"));
    }

    #[rstest]
    #[case(TaskDraft::new(""), ValidationIssue::EmptyTitle)]
    #[case(TaskDraft::new("   "), ValidationIssue::EmptyTitle)]
    #[case(TaskDraft::new("Test").points(-5_i64), ValidationIssue::NegativePoints(-5))]
    #[case(TaskDraft::new("Test").points("lots"), ValidationIssue::InvalidPoints("lots".into()))]
    #[case(TaskDraft::new("x".repeat(51)), ValidationIssue::TitleTooLong { max: 50 })]
    fn rejects_bad_drafts(#[case] draft: TaskDraft, #[case] expected: ValidationIssue) {
        assert_eq!(draft.validate_on(today()), Err(expected));
    }

    #[test]
    fn draft_resolves_optional_fields() {
        let valid = TaskDraft::new("Report")
            .points("40")
            .due_date("tomorrow")
            .category(" Work ")
            .priority(Priority::High)
            .description("")
            .validate_on(today())
            .unwrap();
        let fields = valid.to_fields();
        assert_eq!(fields["points"], json!(40));
        assert_eq!(fields["dueDate"], json!("2025-03-06"));
        assert_eq!(fields["category"], json!("Work"));
        assert_eq!(fields["priority"], json!("high"));
        assert!(!fields.contains_key("description"));
    }

    #[test]
    fn patch_only_carries_changed_fields() {
        let patch = TaskPatch {
            title: Some("Renamed".into()),
            description: Some(" ".into()),
            ..TaskPatch::default()
        };
        let fields = patch.validate_on(today()).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["title"], json!("Renamed"));
        assert_eq!(fields["description"], Value::Null);
        assert!(!fields.contains_key("completed"));
        assert!(TaskPatch::default().is_empty());
    }

    #[test]
    fn patch_validates_like_the_create_form() {
        let patch = TaskPatch {
            points: Some((-1_i64).into()),
            ..TaskPatch::default()
        };
        assert_eq!(
            patch.validate_on(today()),
            Err(ValidationIssue::NegativePoints(-1))
        );
    }
}
