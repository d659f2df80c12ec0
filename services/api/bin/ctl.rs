//! Operational checks against a running API instance.
//!
//! ```text
//! ctl status
//! ctl test-webhook --from +15551234567 --body "Hi"
//! ctl messages --limit 5
//! ctl send --to +15551234567 --message "Hello from Eli"
//! ctl sessions
//! ctl sweep
//! ```

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "ctl")]
#[command(author, version, about = "Operational checks for the AI Superconnector API", long_about = None)]
struct Args {
    /// Base URL of the running API
    #[arg(long, env = "SUPERCONNECTOR_URL", default_value = "http://127.0.0.1:8000")]
    url: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show which integrations the server has configured
    Status,
    /// Post a simulated inbound WhatsApp message to the webhook
    TestWebhook {
        #[arg(long, default_value = "+1234567890")]
        from: String,
        #[arg(long, default_value = "Test message")]
        body: String,
    },
    /// List recent WhatsApp messages through Twilio
    Messages {
        #[arg(long, default_value_t = 10)]
        limit: u32,
        #[arg(long)]
        from: Option<String>,
    },
    /// Send a test WhatsApp message
    Send {
        #[arg(long)]
        to: String,
        #[arg(
            long,
            default_value = "Hello! This is Eli, your AI Superconnector. I'm now configured to receive and respond to your messages!"
        )]
        message: String,
    },
    /// List stored sessions
    Sessions,
    /// Delete sessions idle past the retention window
    Sweep,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("ctl=debug,reqwest=debug")
    } else {
        EnvFilter::new("ctl=warn")
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

async fn json_body(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["message"].as_str().unwrap_or("no error message");
        bail!("server returned {status}: {message}");
    }
    Ok(body)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let base = args.url.trim_end_matches('/');
    let http = reqwest::Client::new();
    debug!(base, command = ?args.command, "Running command");

    match args.command {
        Command::Status => {
            let status = json_body(
                http.get(format!("{base}/twilio/status"))
                    .send()
                    .await
                    .context("API is not reachable")?,
            )
            .await?;
            let flag = |key: &str| if status[key].as_bool() == Some(true) { "yes" } else { "no" };
            println!("Twilio configured:   {}", flag("configured"));
            println!("WhatsApp number:     {}", status["whatsapp_number"].as_str().unwrap_or("-"));
            println!("Phone number:        {}", status["phone_number"].as_str().unwrap_or("-"));
            println!("OpenAI configured:   {}", flag("openai_configured"));
            println!("Media streams:       {}", flag("media_stream_enabled"));
            println!("Session backend:     {}", status["session_backend"].as_str().unwrap_or("-"));
        }
        Command::TestWebhook { from, body } => {
            let form = [
                ("MessageSid", "TEST123".to_string()),
                ("From", format!("whatsapp:{from}")),
                ("Body", body),
                ("NumMedia", "0".to_string()),
            ];
            let response = http
                .post(format!("{base}/twilio/webhook/whatsapp"))
                .form(&form)
                .send()
                .await
                .context("API is not reachable")?;
            let status = response.status();
            let text = response.text().await?;
            if !status.is_success() {
                bail!("webhook returned {status}");
            }
            println!("Webhook endpoint is working.");
            println!("{text}");
        }
        Command::Messages { limit, from } => {
            let mut query = vec![("limit", limit.to_string())];
            if let Some(from) = from {
                query.push(("from_number", from));
            }
            let history = json_body(
                http.get(format!("{base}/twilio/whatsapp/messages"))
                    .query(&query)
                    .send()
                    .await?,
            )
            .await?;
            let messages = history["messages"].as_array().cloned().unwrap_or_default();
            if messages.is_empty() {
                println!("No messages found. Make sure you've joined the Twilio Sandbox.");
            }
            for msg in &messages {
                let direction = if msg["direction"] == "inbound" { "Received" } else { "Sent" };
                let body = msg["body"].as_str().unwrap_or("");
                println!("{direction}: {}", body.chars().take(100).collect::<String>());
                println!("    From: {}", msg["from"].as_str().unwrap_or("-"));
            }
        }
        Command::Send { to, message } => {
            let receipt = json_body(
                http.post(format!("{base}/twilio/whatsapp/send"))
                    .json(&json!({ "to_number": to, "message": message }))
                    .send()
                    .await?,
            )
            .await?;
            println!("Message sent! SID: {}", receipt["sid"].as_str().unwrap_or("-"));
        }
        Command::Sessions => {
            let sessions = json_body(http.get(format!("{base}/sessions")).send().await?).await?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
        }
        Command::Sweep => {
            let result = json_body(http.post(format!("{base}/sessions/sweep")).send().await?).await?;
            println!("Removed {} expired session(s).", result["removed"]);
        }
    }
    Ok(())
}
