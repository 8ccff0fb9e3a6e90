//! geowake-hook: CLI bridge into the GeoWake daemon.
//!
//! Called by notification buttons, boot scripts and the live tracking process.
//! Each invocation sends one command, prints the JSON response data on stdout
//! and exits non-zero when the daemon rejects the command or cannot be reached.
//! Logs go to stderr.

mod daemon_client;

use clap::{Parser, Subcommand, ValueEnum};
use geowake_daemon_protocol::{BootReason, Method};
use serde_json::{json, Map, Value};
use std::env;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "geowake-hook")]
#[command(about = "Send a tracking command to the GeoWake daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Daemon liveness and version
    Health,

    /// Begin a fresh tracking session
    Start {
        /// Progress wake interval; omitted leaves the wake unarmed
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// End tracking from inside the app
    End,

    /// A notification button was pressed
    Action {
        #[arg(value_enum)]
        kind: ActionKind,
    },

    /// The live process confirms it saw a native action
    Ack {
        #[arg(value_enum)]
        kind: ActionKind,
    },

    /// Consume the pending end signal
    TakeEndSignal,

    /// Mark whether the app should resume tracking on next launch
    ResumePending {
        #[arg(action = clap::ArgAction::Set)]
        value: bool,
    },

    /// Print the persisted session and armed timers
    Session,

    /// Fallback alarm management
    Fallback {
        #[command(subcommand)]
        command: FallbackCommand,
    },

    /// Progress wake management
    Wake {
        #[command(subcommand)]
        command: WakeCommand,
    },

    /// Progress notification management
    Progress {
        #[command(subcommand)]
        command: ProgressCommand,
    },

    /// Start alarm feedback and bring up the alarm surface
    LaunchAlarm {
        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        body: Option<String>,

        /// Hide the "continue tracking" choice on the alarm surface
        #[arg(long)]
        no_continue: bool,
    },

    /// Stop alarm feedback
    StopVibration,

    /// Report conditions that undermine background delivery
    Reliability,

    /// Signal an OS boot, restart or package replacement
    Boot {
        #[arg(long, value_enum, default_value_t = BootKind::Boot)]
        reason: BootKind,
    },

    /// Live tracking process registration
    Host {
        #[command(subcommand)]
        command: HostCommand,
    },
}

#[derive(Subcommand)]
enum FallbackCommand {
    /// Arm the fallback alarm
    Schedule {
        #[arg(long)]
        route_id: String,

        #[arg(long, allow_hyphen_values = true)]
        lat: f64,

        #[arg(long, allow_hyphen_values = true)]
        lng: f64,

        #[arg(long)]
        name: String,

        /// Epoch milliseconds at which the alarm should fire
        #[arg(long)]
        trigger_ms: i64,
    },

    /// Disarm the fallback alarm
    Cancel,

    /// Move the armed fallback alarm to now + threshold
    Update {
        #[arg(long)]
        threshold_seconds: u64,
    },
}

#[derive(Subcommand)]
enum WakeCommand {
    Schedule {
        #[arg(long)]
        interval_ms: Option<u64>,
    },
    Cancel,
}

#[derive(Subcommand)]
enum ProgressCommand {
    /// Store and show the latest progress rendering
    Decorate {
        #[arg(long)]
        title: Option<String>,

        #[arg(long)]
        subtitle: Option<String>,

        /// Fraction in [0, 1]
        #[arg(long)]
        progress: Option<f64>,
    },
    Cancel,
}

#[derive(Subcommand)]
enum HostCommand {
    Register {
        #[arg(long)]
        pid: u32,
    },
    Unregister,
    /// Drain queued host events
    Poll,
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionKind {
    End,
    Ignore,
}

#[derive(Clone, Copy, ValueEnum)]
enum BootKind {
    Boot,
    Quickboot,
    PackageReplaced,
}

impl From<BootKind> for BootReason {
    fn from(kind: BootKind) -> Self {
        match kind {
            BootKind::Boot => BootReason::Boot,
            BootKind::Quickboot => BootReason::Quickboot,
            BootKind::PackageReplaced => BootReason::PackageReplaced,
        }
    }
}

impl Commands {
    fn into_request(self) -> (Method, Option<Value>) {
        match self {
            Commands::Health => (Method::GetHealth, None),
            Commands::Start { interval_ms } => (
                Method::StartTracking,
                params([("interval_ms", interval_ms.map(Value::from))]),
            ),
            Commands::End => (Method::EndTracking, None),
            Commands::Action { kind } => match kind {
                ActionKind::End => (Method::HandleEndTracking, None),
                ActionKind::Ignore => (Method::HandleIgnoreTracking, None),
            },
            Commands::Ack { kind } => match kind {
                ActionKind::End => (Method::AcknowledgeNativeEndTracking, None),
                ActionKind::Ignore => (Method::AcknowledgeNativeIgnoreTracking, None),
            },
            Commands::TakeEndSignal => (Method::TakeEndSignal, None),
            Commands::ResumePending { value } => {
                (Method::SetResumePending, Some(json!({ "value": value })))
            }
            Commands::Session => (Method::GetSession, None),
            Commands::Fallback { command } => match command {
                FallbackCommand::Schedule {
                    route_id,
                    lat,
                    lng,
                    name,
                    trigger_ms,
                } => (
                    Method::ScheduleFallbackAlarm,
                    Some(json!({
                        "route_id": route_id,
                        "destination_lat": lat,
                        "destination_lng": lng,
                        "destination_name": name,
                        "trigger_time_ms": trigger_ms,
                    })),
                ),
                FallbackCommand::Cancel => (Method::CancelFallbackAlarm, None),
                FallbackCommand::Update { threshold_seconds } => (
                    Method::UpdateFallbackAlarm,
                    Some(json!({ "threshold_seconds": threshold_seconds })),
                ),
            },
            Commands::Wake { command } => match command {
                WakeCommand::Schedule { interval_ms } => (
                    Method::ScheduleProgressWake,
                    params([("interval_ms", interval_ms.map(Value::from))]),
                ),
                WakeCommand::Cancel => (Method::CancelProgressWake, None),
            },
            Commands::Progress { command } => match command {
                ProgressCommand::Decorate {
                    title,
                    subtitle,
                    progress,
                } => (
                    Method::DecorateProgressNotification,
                    params([
                        ("title", title.map(Value::from)),
                        ("subtitle", subtitle.map(Value::from)),
                        ("progress", progress.map(Value::from)),
                    ]),
                ),
                ProgressCommand::Cancel => (Method::CancelProgressNotification, None),
            },
            Commands::LaunchAlarm {
                title,
                body,
                no_continue,
            } => (
                Method::LaunchAlarm,
                params([
                    ("title", title.map(Value::from)),
                    ("body", body.map(Value::from)),
                    ("allow_continue", Some(Value::from(!no_continue))),
                ]),
            ),
            Commands::StopVibration => (Method::StopVibration, None),
            Commands::Reliability => (Method::CheckReliability, None),
            Commands::Boot { reason } => {
                let reason = BootReason::from(reason);
                (
                    Method::BootCompleted,
                    Some(json!({ "reason": serde_json::to_value(reason).unwrap_or(Value::Null) })),
                )
            }
            Commands::Host { command } => match command {
                HostCommand::Register { pid } => {
                    (Method::RegisterHost, Some(json!({ "pid": pid })))
                }
                HostCommand::Unregister => (Method::UnregisterHost, None),
                HostCommand::Poll => (Method::PollHostEvents, None),
            },
        }
    }
}

/// Builds a params object from the fields that were supplied.
fn params<const N: usize>(fields: [(&str, Option<Value>); N]) -> Option<Value> {
    let map: Map<String, Value> = fields
        .into_iter()
        .filter_map(|(key, value)| value.map(|value| (key.to_string(), value)))
        .collect();
    if map.is_empty() {
        None
    } else {
        Some(Value::Object(map))
    }
}

fn init_logging() {
    let debug_enabled = env::var("GEOWAKE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let (method, params) = cli.command.into_request();
    tracing::debug!(method = method.as_str(), "Sending command to daemon");

    match daemon_client::call(method, params) {
        Ok(data) => println!("{}", data),
        Err(err) => {
            tracing::error!(error = %err, method = method.as_str(), "geowake-hook failed");
            std::process::exit(1);
        }
    }
}
