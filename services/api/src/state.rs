//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the session service,
//! the Twilio client and the chat assistant shared by every handler.

use crate::{config::Config, twilio::TelephonyClient};
use std::sync::Arc;
use superconnector_core::{Assistant, SessionService};

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<SessionService>,
    /// `None` when Twilio credentials are not configured.
    pub telephony: Option<Arc<dyn TelephonyClient>>,
    pub assistant: Arc<Assistant>,
    pub config: Arc<Config>,
}
