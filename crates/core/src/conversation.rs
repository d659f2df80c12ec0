//! Decides how to answer an inbound WhatsApp message.
//!
//! Planning is pure: it reads the sender's session and the message text and
//! returns what to persist and what to do. Side effects (storing contact
//! details, placing the call, asking the chat model) belong to the caller.

use regex::Regex;
use std::sync::LazyLock;

use crate::{
    assistant::{self, ChatPrompt},
    session::Session,
};

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}").expect("valid email regex")
});

// Lead-in phrases match case-insensitively; the name itself must be capitalized.
static NAME_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i:my name is|i'm|i am|this is|it's)\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)",
        r"^([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)\s+(?i:here)\b",
        r"^([A-Z][a-z]+(?:\s+[A-Z][a-z]+)?)$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid name regex"))
    .collect()
});

const CALL_KEYWORDS: &[&str] = &[
    "call me",
    "can you call",
    "give me a call",
    "phone call",
    "voice call",
    "let's talk",
    "prefer to talk",
    "rather talk",
    "switch to call",
    "hop on a call",
    "call you",
    "discuss over a call",
    "talk on the phone",
    "speak with you",
];

/// Contact details found in a message, to be merged into the session.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactUpdate {
    pub name: Option<String>,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnAction {
    /// Place an outbound call to the sender, then confirm with `reply`.
    PlaceCall {
        name: Option<String>,
        email: Option<String>,
        reply: String,
    },
    /// Answer with fixed text.
    Reply(String),
    /// Ask the chat model.
    Chat(ChatPrompt),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnPlan {
    pub contact: Option<ContactUpdate>,
    pub action: TurnAction,
}

pub fn extract_email(message: &str) -> Option<String> {
    EMAIL_RE.find(message).map(|m| m.as_str().to_string())
}

pub fn extract_name(message: &str) -> Option<String> {
    let message = message.trim();
    NAME_RES
        .iter()
        .find_map(|re| re.captures(message))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Guesses a first name from the local part of an address,
/// e.g. `john.doe@example.com` -> `John`.
pub fn name_from_email(email: &str) -> Option<String> {
    let local = email.split('@').next()?;
    let spaced = local.replace(['.', '_', '-'], " ");
    let first = spaced.split_whitespace().next()?;
    let mut chars = first.chars();
    let head = chars.next()?;
    Some(head.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect())
}

pub fn wants_call(message: &str) -> bool {
    let lower = message.to_lowercase();
    CALL_KEYWORDS.iter().any(|k| lower.contains(k))
}

fn calling_reply(lead: &str, fallback: &str, name: Option<&str>) -> String {
    match name {
        Some(name) if !name.is_empty() => format!("{lead}, {name}! I'm calling you right now! 📞"),
        _ => format!("{fallback}! I'm calling you right now! 📞"),
    }
}

/// Plans the answer to `message` from a sender whose live session is `session`.
///
/// Precedence: a user returning after a completed call, then a message that
/// carries an email address, then an explicit call request, then open chat.
pub fn plan_turn(session: Option<&Session>, message: &str) -> TurnPlan {
    let call_requested = wants_call(message);

    if let Some(session) = session.filter(|s| s.call_completed) {
        let action = if call_requested {
            TurnAction::PlaceCall {
                name: session.name.clone(),
                email: session.email.clone(),
                reply: calling_reply("Of course", "Absolutely", session.name.as_deref()),
            }
        } else {
            TurnAction::Chat(assistant::returning_user_prompt(
                session.name.as_deref(),
                message,
            ))
        };
        return TurnPlan {
            contact: None,
            action,
        };
    }

    if let Some(email) = extract_email(message) {
        let name = extract_name(message).or_else(|| name_from_email(&email));
        let action = if call_requested {
            TurnAction::PlaceCall {
                name: name.clone(),
                email: Some(email.clone()),
                reply: calling_reply("Perfect", "Great", name.as_deref()),
            }
        } else {
            let reply = match &name {
                Some(name) => format!(
                    "Perfect, {name}! I have your email as {email}. Let's explore how I can help you build meaningful professional connections. What kind of networking goals do you have in mind?"
                ),
                None => format!(
                    "Great! I have your email as {email}. Let's explore how I can help you build meaningful professional connections. What are your networking goals?"
                ),
            };
            TurnAction::Reply(reply)
        };
        return TurnPlan {
            contact: Some(ContactUpdate { name, email }),
            action,
        };
    }

    if call_requested {
        let action = match session.filter(|s| s.info_provided) {
            Some(session) => TurnAction::PlaceCall {
                name: session.name.clone(),
                email: session.email.clone(),
                reply: calling_reply("Of course", "Absolutely", session.name.as_deref()),
            },
            None => TurnAction::Reply(
                "I'd love to call you! Just need your email address first so I can connect with you."
                    .to_string(),
            ),
        };
        return TurnPlan {
            contact: None,
            action,
        };
    }

    TurnPlan {
        contact: None,
        action: TurnAction::Chat(assistant::onboarding_prompt(message)),
    }
}
