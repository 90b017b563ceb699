#![forbid(unsafe_code)]

//! `tabletalk-ctl`, the local CLI companion for `tabletalk`.
//!
//! Talks to the server's HTTP API and prints JSON responses. Designed for
//! operators inspecting or reclaiming sessions from the host itself.

use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "tabletalk-ctl",
    about = "Local CLI for the tabletalk server",
    version,
    long_about = None
)]
struct Cli {
    /// Base URL of the server, e.g. `http://127.0.0.1:8000`.
    ///
    /// When omitted, derived from `--port` against localhost.
    #[arg(long)]
    url: Option<String>,

    /// Server HTTP port used when `--url` is not set.
    #[arg(long, default_value_t = 8000)]
    port: u16,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Resolve the effective base URL.
    ///
    /// If `--url` was explicitly provided, use it as-is (minus any
    /// trailing slash). Otherwise derive from `--port`.
    fn effective_base_url(&self) -> String {
        if let Some(ref url) = self.url {
            url.trim_end_matches('/').to_owned()
        } else {
            format!("http://127.0.0.1:{}", self.port)
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show server-wide statistics.
    Stats,

    /// List session ids, least recently used first.
    List,

    /// Show one session's full record.
    Show {
        /// Session ID.
        id: String,
    },

    /// Create a session.
    Create {
        /// Session ID to register; generated when omitted.
        #[arg(long)]
        id: Option<String>,
    },

    /// Delete a session, tearing down its engine and workspace.
    Delete {
        /// Session ID.
        id: String,
    },

    /// Record a client heartbeat for a session.
    Heartbeat {
        /// Session ID.
        id: String,
    },

    /// Submit a chat message to a session.
    Message {
        /// Session ID.
        id: String,
        /// Message text.
        text: String,
    },

    /// Print a session's transcript.
    History {
        /// Session ID.
        id: String,
    },

    /// Force an immediate memory cleanup pass.
    Cleanup,
}

fn main() {
    let args = Cli::parse();
    let base = args.effective_base_url();

    match send_request(&base, &args.command) {
        Ok(body) => {
            println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
        }
        Err(err) => {
            eprintln!("Error: {err}");
            eprintln!("Is tabletalk running at {base}?");
            std::process::exit(1);
        }
    }
}

/// Send one API request and return the decoded JSON body.
fn send_request(
    base: &str,
    command: &Command,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;

    let response = match command {
        Command::Stats => client.get(format!("{base}/api/system/stats")).send()?,
        Command::List => client.get(format!("{base}/api/session/list")).send()?,
        Command::Show { id } => client.get(format!("{base}/api/session/{id}")).send()?,
        Command::Create { id } => {
            let mut body = serde_json::json!({});
            if let Some(session_id) = id {
                body["session_id"] = serde_json::Value::String(session_id.clone());
            }
            client
                .post(format!("{base}/api/session/create"))
                .json(&body)
                .send()?
        }
        Command::Delete { id } => client.delete(format!("{base}/api/session/{id}")).send()?,
        Command::Heartbeat { id } => client
            .post(format!("{base}/api/session/{id}/heartbeat"))
            .send()?,
        Command::Message { id, text } => client
            .post(format!("{base}/api/chat/message/{id}"))
            .json(&serde_json::json!({"message": text}))
            .send()?,
        Command::History { id } => client.get(format!("{base}/api/chat/history/{id}")).send()?,
        Command::Cleanup => client.post(format!("{base}/api/system/cleanup")).send()?,
    };

    let status = response.status();
    let body: serde_json::Value = response.json()?;

    if status.is_success() {
        Ok(body)
    } else {
        let detail = body
            .get("detail")
            .and_then(|value| value.as_str())
            .unwrap_or("unknown error");
        Err(format!("{status}: {detail}").into())
    }
}
