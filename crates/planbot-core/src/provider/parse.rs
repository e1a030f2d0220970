//! Pure reply parsers shared by the interactive providers.

use crate::driver::QuestionOption;

use super::{ApprovalResponse, QuestionResponse};

/// Words that count as an approval (compared lowercased, trimmed).
const APPROVAL_WORDS: &[&str] = &[
    "y", "yes", "approve", "approved", "ok", "lgtm", "thumbsup", "👍",
];

/// Interpret a free-form reply to a plan prompt.
///
/// Anything other than a recognized approval word is a rejection whose
/// reason is the trimmed reply text (possibly empty).
pub fn parse_approval(text: &str) -> ApprovalResponse {
    let trimmed = text.trim();
    let lower = trimmed.to_lowercase();
    if APPROVAL_WORDS.contains(&lower.as_str()) {
        ApprovalResponse {
            approved: true,
            reason: None,
            responded_by: None,
        }
    } else {
        ApprovalResponse {
            approved: false,
            reason: (!trimmed.is_empty()).then(|| trimmed.to_string()),
            responded_by: None,
        }
    }
}

/// Interpret a free-form reply to a question.
///
/// With options, a decimal 1..=N picks by position and an exact
/// case-insensitive label match picks by label; anything else is passed
/// through verbatim with `matched_option = false`.
pub fn parse_question_reply(text: &str, options: &[QuestionOption]) -> QuestionResponse {
    let trimmed = text.trim();

    if !options.is_empty() {
        if let Ok(n) = trimmed.parse::<usize>() {
            if (1..=options.len()).contains(&n) {
                return QuestionResponse {
                    answer: options[n - 1].value.clone(),
                    matched_option: true,
                    responded_by: None,
                };
            }
        }

        if let Some(option) = options
            .iter()
            .find(|o| o.label.eq_ignore_ascii_case(trimmed))
        {
            return QuestionResponse {
                answer: option.value.clone(),
                matched_option: true,
                responded_by: None,
            };
        }
    }

    QuestionResponse {
        answer: trimmed.to_string(),
        matched_option: false,
        responded_by: None,
    }
}
