//! AI Superconnector API Library Crate
//!
//! The web service behind the WhatsApp and voice gateway: configuration,
//! session store backends, the Twilio client and TwiML rendering, webhooks,
//! the JSON API and the media-stream bridge. The binaries are thin wrappers
//! around this library.

pub mod audio_utils;
pub mod config;
pub mod convex;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod sweeper;
pub mod twilio;
pub mod twiml;
pub mod webhooks;
pub mod ws;
