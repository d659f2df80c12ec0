//! Eli, the superconnector persona: prompts, canned fallbacks, and the
//! chat-model wrapper that picks between them.

use std::sync::Arc;
use tracing::warn;

use crate::llm_client::{ChatRequest, LLMClient};

/// A chat request together with the text to use when the model is unavailable.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatPrompt {
    pub request: ChatRequest,
    pub fallback: String,
}

const ONBOARDING_SYSTEM: &str = "You are Eli, a human-like AI Superconnector. Your goal is to:
1. Get the user's name and email address naturally in conversation.
2. Help them with networking goals via chat OR voice call (if they request it).
3. Be warm, charismatic, and engaging.
4. Keep your responses short, human, and conversational for WhatsApp.
5. You CAN make voice calls if users ask - just say \"I'm calling you now!\"
6. Do NOT automatically suggest calling when they give you their email.

Example interactions:
User: Hi
Eli: Hey there! I'm Eli, your personal superconnector. To get started, could you tell me your name and email address?

User: What do you do?
Eli: I help professionals like you build amazing connections! I can introduce you to the right people, help you expand your network, and open doors to new opportunities. What's your name and email so we can get started?";

const INBOUND_VOICE_SYSTEM: &str = "You are Eli, a warm, charismatic superconnector having a phone conversation.
You just asked for their name and they responded.
Your response should:
1. Acknowledge their name warmly
2. Briefly introduce yourself as someone who helps people build meaningful professional connections
3. Mention you'll follow up on WhatsApp for a deeper conversation
4. Keep it natural, conversational, and under 15 seconds of speaking
5. Sound genuinely excited to help them
Do NOT ask more questions - you'll continue on WhatsApp.";

/// Instructions for the realtime voice model on a bridged outbound call.
pub fn realtime_instructions(name: Option<&str>, email: Option<&str>) -> String {
    let common = "You help professionals build meaningful connections and expand their network.
Be conversational, engaging, and genuinely interested in helping them.
Keep responses concise and natural for phone conversation.
Show enthusiasm about their networking goals.";
    match name.filter(|n| !n.is_empty() && *n != "there") {
        Some(name) => {
            let known = match email.filter(|e| !e.is_empty()) {
                Some(email) => format!("You already know their name is {name} and their email is {email}."),
                None => format!("You already know their name is {name}."),
            };
            format!(
                "You are Eli, a warm, charismatic AI superconnector having a phone conversation with {name}.
{known}
Don't ask for their name or email again - you already have this information.
{common}
Use their name naturally in conversation."
            )
        }
        None => format!(
            "You are Eli, a warm, charismatic AI superconnector having a phone conversation.
{common}"
        ),
    }
}

/// The line the realtime model is asked to open a bridged call with.
pub fn realtime_greeting(name: Option<&str>) -> String {
    match name.filter(|n| !n.is_empty() && *n != "there") {
        Some(name) => format!(
            "Hi {name}! I heard you're interested in expanding your professional network. What specific connections are you looking to make?"
        ),
        None => "Hi! I understand you're looking to expand your professional network. What kind of connections would be most valuable for you?".to_string(),
    }
}

pub fn onboarding_prompt(message: &str) -> ChatPrompt {
    ChatPrompt {
        request: ChatRequest {
            system: ONBOARDING_SYSTEM.to_string(),
            user: message.to_string(),
            max_tokens: 100,
            temperature: 0.8,
        },
        fallback: "Hello! I'm Eli, your AI Superconnector. To get started, please share your name and email address.".to_string(),
    }
}

pub fn returning_user_prompt(name: Option<&str>, message: &str) -> ChatPrompt {
    let name = name.filter(|n| !n.is_empty()).unwrap_or("there");
    ChatPrompt {
        request: ChatRequest {
            system: format!(
                "You are Eli, a warm AI Superconnector.
You just had a voice call with {name} about networking.
Continue the conversation naturally on WhatsApp.
Be helpful, warm, and focus on their networking goals.
Keep responses short and conversational.
Don't ask for their name/email again - you already have it.
If they ask to call, you CAN call them - just let them know you're calling."
            ),
            user: message.to_string(),
            max_tokens: 100,
            temperature: 0.8,
        },
        fallback: format!(
            "Great to continue our conversation, {name}! How can I help you build your network today?"
        ),
    }
}

/// Reply to a caller who just told us their name on an inbound call.
pub fn inbound_voice_prompt(speech: &str) -> ChatPrompt {
    ChatPrompt {
        request: ChatRequest {
            system: INBOUND_VOICE_SYSTEM.to_string(),
            user: format!("My name is {speech}"),
            max_tokens: 100,
            temperature: 0.9,
        },
        fallback: format!(
            "Great to meet you, {speech}! I'm Eli, and I help professionals build amazing connections. Let me message you on WhatsApp right now so we can explore how I can help you expand your network!"
        ),
    }
}

/// Reply to a user describing their goals on an outbound call.
pub fn outbound_voice_prompt(name: &str, email: &str, speech: &str) -> ChatPrompt {
    ChatPrompt {
        request: ChatRequest {
            system: format!(
                "You are Eli, a warm, charismatic AI superconnector on a phone call with {name}.
They just told you about their networking goals.
Your response should:
1. Show genuine enthusiasm about their goals
2. Briefly mention how you can help them achieve those specific goals
3. Build excitement about the connections you'll make for them
4. Keep it natural, conversational, and under 15 seconds
5. Do NOT ask more questions - you'll continue on WhatsApp
6. Sound confident and knowledgeable about networking

Their email: {email}
What they said: {speech}"
            ),
            user: speech.to_string(),
            max_tokens: 120,
            temperature: 0.85,
        },
        fallback: "That sounds amazing! I can definitely help you with that. I have connections across various industries and I'm already thinking of some perfect matches for you. This is going to be exciting!".to_string(),
    }
}

/// Answers prompts with the chat model when one is configured.
#[derive(Clone, Default)]
pub struct Assistant {
    llm: Option<Arc<dyn LLMClient>>,
}

impl Assistant {
    pub fn new(llm: Option<Arc<dyn LLMClient>>) -> Self {
        Self { llm }
    }

    pub fn is_enabled(&self) -> bool {
        self.llm.is_some()
    }

    /// Returns the model's answer, or the prompt's fallback text if there is
    /// no model or the call fails.
    pub async fn reply(&self, prompt: ChatPrompt) -> String {
        let Some(llm) = &self.llm else {
            return prompt.fallback;
        };
        match llm.complete(prompt.request).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Chat completion failed; using fallback reply");
                prompt.fallback
            }
        }
    }
}
