//! Command-line arguments.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use skyproxy_agent::config::{DEFAULT_PROBE_TIMEOUT, DEFAULT_PROBE_URL};

/// SkyProxy - switch the system proxy between saved profiles
#[derive(Parser, Debug)]
#[command(name = "skyproxy", version, about)]
pub struct Args {
    /// Database file (defaults to the platform data directory)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Where proxy settings are applied
    #[arg(long, value_enum, default_value_t = SinkKind::Stored, global = true)]
    pub sink: SinkKind,

    /// Endpoint used by `test`; must answer {"ip": "..."}
    #[arg(long, default_value = DEFAULT_PROBE_URL, global = true)]
    pub probe_url: String,

    /// Seconds before a connectivity test is reported as timed out
    #[arg(long, default_value_t = DEFAULT_PROBE_TIMEOUT.as_secs(), global = true)]
    pub probe_timeout: u64,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Proxy settings backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// Record the configuration in the database
    Stored,
    /// GNOME system proxy via gsettings
    Gnome,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List saved profiles
    List,
    /// Show the applied proxy configuration
    Status,
    /// Add a profile
    Add(ProfileArgs),
    /// Edit a profile; omitted fields keep their value
    Edit {
        /// Profile index as shown by `list`
        index: usize,
        #[command(flatten)]
        profile: ProfileArgs,
    },
    /// Delete a profile
    Delete {
        /// Profile index as shown by `list`
        index: usize,
    },
    /// Apply a profile
    Use {
        /// Profile index as shown by `list`
        index: usize,
    },
    /// Turn the proxy on (active profile, else the first one)
    On,
    /// Switch to a direct connection
    Off,
    /// Test connectivity through a profile, then restore the current settings
    Test {
        /// Profile index as shown by `list`
        index: usize,
    },
    /// Bypass rule tools
    #[command(subcommand)]
    Rules(RulesCommand),
}

#[derive(Subcommand, Debug)]
pub enum RulesCommand {
    /// Classify and validate a comma-separated rule list
    Check {
        /// Rules, e.g. "localhost, *.example.com, 10.0.0.0/8"
        text: String,
    },
    /// Print a rule template, or list templates when no name is given
    Template {
        /// minimal, basic, development or china
        name: Option<String>,
    },
}

/// Profile fields for `add` and `edit`.
#[derive(ClapArgs, Debug, Default, Clone)]
pub struct ProfileArgs {
    /// Display name (defaults to the host)
    #[arg(long)]
    pub name: Option<String>,

    /// http, https, socks4 or socks5
    #[arg(long)]
    pub scheme: Option<String>,

    /// Proxy host name or IPv4 address
    #[arg(long)]
    pub host: Option<String>,

    /// Proxy port
    #[arg(long)]
    pub port: Option<String>,

    /// Comma-separated bypass rules
    #[arg(long)]
    pub bypass: Option<String>,

    /// Use a bypass rule template instead of --bypass
    #[arg(long, conflicts_with = "bypass")]
    pub template: Option<String>,
}
