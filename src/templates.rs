//! Built-in poll templates

use crate::Result;
use crate::types::NewPoll;
use serde::Serialize;

/// A ready-made question with its options
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollTemplate {
    pub id: &'static str,
    pub label: &'static str,
    pub question: &'static str,
    pub description: Option<&'static str>,
    pub options: &'static [&'static str],
}

impl PollTemplate {
    /// Validated poll input prefilled from this template
    pub fn to_new_poll(&self) -> Result<NewPoll> {
        NewPoll::new(
            self.question,
            self.description,
            self.options.iter().map(|option| option.to_string()).collect(),
        )
    }
}

const TEMPLATES: &[PollTemplate] = &[
    PollTemplate {
        id: "yes-no",
        label: "Yes / No",
        question: "Do you agree?",
        description: None,
        options: &["Yes", "No"],
    },
    PollTemplate {
        id: "scale-5",
        label: "1–5 Scale",
        question: "How would you rate this?",
        description: None,
        options: &["1", "2", "3", "4", "5"],
    },
    PollTemplate {
        id: "simple-choice",
        label: "Simple Choice",
        question: "Which do you prefer?",
        description: None,
        options: &["Option A", "Option B", "Option C"],
    },
    PollTemplate {
        id: "feedback",
        label: "Feedback",
        question: "How can we improve?",
        description: None,
        options: &["More features", "Better UX", "Faster performance", "Other"],
    },
    PollTemplate {
        id: "meeting-time",
        label: "Meeting Time",
        question: "When works best for our meeting?",
        description: None,
        options: &["Morning", "Afternoon", "Evening", "Flexible"],
    },
    PollTemplate {
        id: "topic-vote",
        label: "Topic Vote",
        question: "What should we discuss next?",
        description: None,
        options: &["Project update", "New ideas", "Q&A", "Feedback session"],
    },
];

pub fn builtin() -> &'static [PollTemplate] {
    TEMPLATES
}

pub fn template_by_id(id: &str) -> Option<&'static PollTemplate> {
    TEMPLATES.iter().find(|template| template.id == id)
}
