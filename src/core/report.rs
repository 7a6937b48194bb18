//! Structured relationship reports
//!
//! A report turn uses the normal persona prompt plus an instruction asking the
//! model for a JSON object with a title and a list of suggestions.

use serde::{Deserialize, Serialize};

/// Appended to the persona prompt for report turns
pub const REPORT_INSTRUCTION: &str = r#"

After answering, produce a relationship report for the user. The title is "<user name>'s relationship report" and the content is a list of concrete suggestions.
Reply with a single JSON object and nothing else, for example:
{"title": "Alex's relationship report",
 "suggestions": [
   "Widen your social circle: join community events and online groups.",
   "Practise communication: state your needs clearly and listen actively."
 ]}
"#;

/// A titled list of suggestions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub title: String,
    pub suggestions: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("model reply contains no JSON object")]
    MissingJson,

    #[error("model reply is not a valid report: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Report {
    /// Parse a model reply; prose or code fences around the object are ignored
    pub fn parse(reply: &str) -> Result<Self, ReportError> {
        let start = reply.find('{').ok_or(ReportError::MissingJson)?;
        let end = reply.rfind('}').ok_or(ReportError::MissingJson)?;
        if end < start {
            return Err(ReportError::MissingJson);
        }
        Ok(serde_json::from_str(&reply[start..=end])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_json() {
        let report = Report::parse(r#"{"title": "小明的恋爱报告", "suggestions": ["多沟通", "多陪伴"]}"#).unwrap();
        assert_eq!(report.title, "小明的恋爱报告");
        assert_eq!(report.suggestions, vec!["多沟通", "多陪伴"]);
    }

    #[test]
    fn test_parse_fenced_reply() {
        let reply = "Here is your report:\n```json\n{\"title\": \"T\", \"suggestions\": []}\n```";
        let report = Report::parse(reply).unwrap();
        assert_eq!(report.title, "T");
        assert!(report.suggestions.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed_replies() {
        assert!(matches!(Report::parse("no json here"), Err(ReportError::MissingJson)));
        assert!(matches!(Report::parse("} backwards {"), Err(ReportError::MissingJson)));
        assert!(matches!(
            Report::parse(r#"{"title": "T"}"#),
            Err(ReportError::Malformed(_))
        ));
    }
}
