//! Session log artifact written to `.relay/state/sessions/<id>.session.json`.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::events::{Decoded, EventKind, SessionEvent, SkippedLine, extract_plan_text};

/// Per-kind counters kept at the top of the artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub total_events: usize,
    pub text: usize,
    pub tool_uses: usize,
    pub results: usize,
    pub other: usize,
    pub skipped: usize,
}

/// Ordered events from one agent run plus the lines that failed to decode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionLog {
    pub summary: SessionSummary,
    pub events: Vec<SessionEvent>,
    pub skipped: Vec<SkippedLine>,
}

impl SessionLog {
    pub fn record(&mut self, decoded: Decoded) {
        match decoded {
            Decoded::Event(event) => self.push_event(event),
            Decoded::Malformed(skipped) => {
                warn!(
                    line = skipped.line,
                    error = %skipped.error,
                    "skipping malformed agent output line"
                );
                self.summary.skipped += 1;
                self.skipped.push(skipped);
            }
            Decoded::Blank => {}
        }
    }

    fn push_event(&mut self, event: SessionEvent) {
        self.summary.total_events += 1;
        match event.kind {
            EventKind::Text => self.summary.text += 1,
            EventKind::ToolUse => self.summary.tool_uses += 1,
            EventKind::Result => self.summary.results += 1,
            EventKind::Other => self.summary.other += 1,
        }
        self.events.push(event);
    }

    /// Plan text assembled from the run's assistant and result text.
    pub fn plan_text(&self) -> Option<String> {
        extract_plan_text(&self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::decode_line;

    /// Verifies a malformed line is counted and kept aside while later events
    /// are still collected in order.
    #[test]
    fn malformed_line_is_skipped_not_fatal() {
        let lines = [
            r#"{"type":"system","subtype":"init"}"#,
            "not json at all",
            r#"{"type":"assistant","message":"working"}"#,
            "",
            r#"{"type":"result","result":"done"}"#,
        ];
        let mut log = SessionLog::default();
        for (idx, line) in lines.iter().enumerate() {
            log.record(decode_line(idx + 1, line));
        }

        assert_eq!(log.summary.total_events, 3);
        assert_eq!(log.summary.skipped, 1);
        assert_eq!(log.skipped[0].line, 2);
        let order: Vec<usize> = log.events.iter().map(|event| event.line).collect();
        assert_eq!(order, vec![1, 3, 5]);
        assert_eq!(log.plan_text().as_deref(), Some("working\n\ndone"));
    }

    #[test]
    fn serializes_summary_first() {
        let log = SessionLog::default();
        let json = serde_json::to_string(&log).expect("serialize");
        assert!(json.starts_with("{\"summary\":{\"total_events\":0"));
    }
}
