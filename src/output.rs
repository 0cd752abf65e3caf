//! The canonical data model produced by a cell run (spec §3 "Outputs").

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The family of `{ ui: "...", ... }` shapes recognized as first-class
/// display content (spec §6 "UI Display schema").
pub const UI_KINDS: &[&str] = &[
    "image",
    "markdown",
    "html",
    "json",
    "code",
    "table",
    "dataSummary",
    "alert",
    "badge",
    "metric",
    "progress",
    "spinner",
];

/// The vendor MIME type attached to values matching the UI Display schema.
pub const UI_MIME_TYPE: &str = "application/x-nodebooks-ui+json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamOutput {
    pub name: StreamName,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DisplayMetadata {
    /// Present (and `true`) only for displays that were pushed live during
    /// the run, as opposed to the single terminal display built from the
    /// cell's returned value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streamed: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayOutput {
    pub data: BTreeMap<String, serde_json::Value>,
    pub metadata: DisplayMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorOutput {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotebookOutput {
    Stream(StreamOutput),
    DisplayData(DisplayOutput),
    Error(ErrorOutput),
}

impl NotebookOutput {
    pub fn stream(name: StreamName, text: impl Into<String>) -> Self {
        NotebookOutput::Stream(StreamOutput {
            name,
            text: text.into(),
        })
    }

    pub fn display(data: BTreeMap<String, serde_json::Value>, streamed: bool) -> Self {
        NotebookOutput::DisplayData(DisplayOutput {
            data,
            metadata: DisplayMetadata {
                streamed: streamed.then_some(true),
            },
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputExecution {
    pub started: u128,
    pub ended: u128,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorOutput>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecuteResult {
    pub outputs: Vec<NotebookOutput>,
    pub execution: OutputExecution,
}

/// Builds the MIME-keyed payload for a display value (spec §3 "A display
/// value carries at minimum `text/plain`..."): `text/plain` (the raw string
/// for string values, otherwise its JSON rendering), `application/json`,
/// and, when the value matches the UI Display schema, the vendor MIME.
/// Shared by the execution loop's terminal display and the streamed
/// `@nodebooks/ui` display hook so both build the same shape.
pub fn build_display_data(value: &serde_json::Value) -> BTreeMap<String, serde_json::Value> {
    let mut data = BTreeMap::new();

    let text = match value {
        serde_json::Value::String(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "null".to_string()),
    };
    data.insert("text/plain".to_string(), serde_json::Value::String(text));
    data.insert("application/json".to_string(), value.clone());

    if matches_ui_display_schema(value) {
        data.insert(UI_MIME_TYPE.to_string(), value.clone());
    }

    data
}

/// Returns whether a decoded JSON value matches the minimum UI Display
/// schema: a plain object carrying a recognized `ui` discriminant.
pub fn matches_ui_display_schema(value: &serde_json::Value) -> bool {
    value
        .as_object()
        .and_then(|obj| obj.get("ui"))
        .and_then(|ui| ui.as_str())
        .map(|ui| UI_KINDS.contains(&ui))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recognizes_ui_display_shapes() {
        assert!(matches_ui_display_schema(
            &json!({ "ui": "markdown", "markdown": "# Hi" })
        ));
        assert!(!matches_ui_display_schema(&json!({ "not_ui": true })));
        assert!(!matches_ui_display_schema(&json!({ "ui": "bogus" })));
        assert!(!matches_ui_display_schema(&json!(42)));
    }

    #[test]
    fn build_display_data_renders_strings_unquoted() {
        let data = build_display_data(&json!("hello"));
        assert_eq!(data.get("text/plain"), Some(&json!("hello")));
        assert_eq!(data.get("application/json"), Some(&json!("hello")));
        assert!(!data.contains_key(UI_MIME_TYPE));
    }

    #[test]
    fn build_display_data_tags_ui_schema_values() {
        let value = json!({ "ui": "markdown", "markdown": "# Hi" });
        let data = build_display_data(&value);
        assert_eq!(data.get(UI_MIME_TYPE), Some(&value));
        assert_eq!(data.get("application/json"), Some(&value));
    }

    #[test]
    fn build_display_data_stringifies_numbers_for_text_plain() {
        let data = build_display_data(&json!(5));
        assert_eq!(data.get("text/plain"), Some(&json!("5")));
    }

    #[test]
    fn display_output_marks_streamed_flag() {
        let mut data = BTreeMap::new();
        data.insert("text/plain".to_string(), json!("hi"));

        let streamed = NotebookOutput::display(data.clone(), true);
        let terminal = NotebookOutput::display(data, false);

        match (streamed, terminal) {
            (NotebookOutput::DisplayData(s), NotebookOutput::DisplayData(t)) => {
                assert_eq!(s.metadata.streamed, Some(true));
                assert_eq!(t.metadata.streamed, None);
            }
            _ => panic!("expected DisplayData variants"),
        }
    }
}
