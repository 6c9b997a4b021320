//! Command execution.
//!
//! Every command returns the text to print. Errors carry the message shown
//! to the user and make the process exit non-zero.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use skyproxy_agent::{
    AgentConfig, Background, GnomeProxySink, HttpProbe, KeyValueStore, LoadReport,
    ProfileController, ProxySettingsSink, StoredSink,
};
use skyproxy_core::{
    format_rule_list, parse_rule_list, ProfileDraft, ProxyConfig, ProxyProfile, RuleTemplate,
};
use skyproxy_storage::Database;

use crate::cli::{Command, ProfileArgs, RulesCommand, SinkKind};

/// The wired-up agent for one invocation.
pub struct App {
    controller: ProfileController,
    sink_name: &'static str,
}

impl App {
    pub fn new(db: Database, sink: SinkKind, config: &AgentConfig) -> Self {
        let store: Arc<dyn KeyValueStore> = Arc::new(db);
        let sink: Arc<dyn ProxySettingsSink> = match sink {
            SinkKind::Stored => Arc::new(StoredSink::new(store.clone())),
            SinkKind::Gnome => Arc::new(GnomeProxySink::new()),
        };
        let sink_name = sink.name();
        let background = Background::new(sink, Arc::new(HttpProbe::new(config)), config);

        Self {
            controller: ProfileController::new(store, Arc::new(background)),
            sink_name,
        }
    }

    /// Loads the saved profiles, repairing damaged records.
    pub async fn load(&self) -> Result<LoadReport> {
        self.controller
            .load()
            .await
            .context("Failed to load profiles")
    }

    /// Waits for any in-flight operation, including the restore of an
    /// abandoned connectivity test.
    pub async fn wait_idle(&self) {
        self.controller.wait_idle().await;
    }

    /// Runs one command.
    pub async fn run(&self, command: Command) -> Result<String> {
        match command {
            Command::List => Ok(self.list()),
            Command::Status => self.status().await,
            Command::Add(args) => self.add(&args).await,
            Command::Edit { index, profile } => self.edit(index, &profile).await,
            Command::Delete { index } => {
                let removed = self.controller.delete_profile(index).await?;
                Ok(format!("Deleted profile {index}: {}", removed.display_name()))
            }
            Command::Use { index } => {
                self.controller.activate(index).await?;
                self.status().await
            }
            Command::On => {
                self.controller.set_enabled(true).await?;
                self.status().await
            }
            Command::Off => {
                self.controller.set_enabled(false).await?;
                self.status().await
            }
            Command::Test { index } => self.test(index).await,
            Command::Rules(rules) => run_rules(&rules),
        }
    }

    fn list(&self) -> String {
        let state = self.controller.state();
        if state.profiles.is_empty() {
            return "No profiles saved. Add one with `skyproxy add`.".to_string();
        }

        let mut out = String::new();
        for (index, profile) in state.profiles.iter().enumerate() {
            let _ = writeln!(
                out,
                "{}",
                profile_line(index, profile, state.active == Some(index))
            );
        }
        out.trim_end().to_string()
    }

    async fn status(&self) -> Result<String> {
        let state = self.controller.proxy_state().await?;
        let line = match (state.active_profile, state.proxy_config) {
            (Some(profile), _) => format!(
                "Proxy on: {} ({})",
                profile.display_name(),
                profile.server()
            ),
            (None, Some(ProxyConfig::Direct)) => "Proxy off: direct connection".to_string(),
            (None, Some(config)) => format!("Proxy on: {config} (not a saved profile)"),
            (None, None) => "Proxy state unknown".to_string(),
        };
        Ok(format!("{line} [sink: {}]", self.sink_name))
    }

    async fn add(&self, args: &ProfileArgs) -> Result<String> {
        let draft = apply_args(
            ProfileDraft {
                scheme: "http".to_string(),
                ..ProfileDraft::default()
            },
            args,
        )?;
        let index = self.controller.add_profile(&draft).await?;
        let profile = &self.controller.profiles()[index];
        Ok(format!(
            "Added profile {index}: {} ({})",
            profile.display_name(),
            profile.server()
        ))
    }

    async fn edit(&self, index: usize, args: &ProfileArgs) -> Result<String> {
        let current = self
            .controller
            .profiles()
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow!("no profile at index {index}"))?;

        let draft = apply_args(ProfileDraft::from_profile(&current), args)?;
        self.controller.edit_profile(index, &draft).await?;
        Ok(format!("Updated profile {index}"))
    }

    async fn test(&self, index: usize) -> Result<String> {
        let name = self
            .controller
            .profiles()
            .get(index)
            .map(|p| p.display_name().to_string())
            .unwrap_or_default();

        let ip = self.controller.test_profile(index).await?;
        Ok(format!("Connection OK through {name}. Public IP: {ip}"))
    }
}

/// Overlays command-line fields onto a draft.
fn apply_args(mut draft: ProfileDraft, args: &ProfileArgs) -> Result<ProfileDraft> {
    if let Some(name) = &args.name {
        draft.name = name.clone();
    }
    if let Some(scheme) = &args.scheme {
        draft.scheme = scheme.clone();
    }
    if let Some(host) = &args.host {
        draft.host = host.clone();
    }
    if let Some(port) = &args.port {
        draft.port = port.clone();
    }
    if let Some(bypass) = &args.bypass {
        draft.bypass = bypass.clone();
    }
    if let Some(name) = &args.template {
        draft.bypass = format_rule_list(template(name)?.rules());
    }
    Ok(draft)
}

fn template(name: &str) -> Result<RuleTemplate> {
    RuleTemplate::from_name(name).ok_or_else(|| {
        let known: Vec<_> = RuleTemplate::ALL.iter().map(|t| t.as_str()).collect();
        anyhow!(
            "unknown template {name:?} (expected one of: {})",
            known.join(", ")
        )
    })
}

fn profile_line(index: usize, profile: &ProxyProfile, active: bool) -> String {
    let marker = if active { "*" } else { " " };
    let mut line = format!(
        "{marker} {index}  {}  {}",
        profile.display_name(),
        profile.server()
    );
    if !profile.bypass_list.is_empty() {
        let _ = write!(line, "  bypass: {}", format_rule_list(&profile.bypass_list));
    }
    line
}

/// Runs a `rules` subcommand. These need no database.
pub fn run_rules(command: &RulesCommand) -> Result<String> {
    match command {
        RulesCommand::Check { text } => check_rules(text),
        RulesCommand::Template { name: None } => {
            let mut out = String::new();
            for t in RuleTemplate::ALL {
                let _ = writeln!(out, "{:<12} {}", t.as_str(), format_rule_list(t.rules()));
            }
            Ok(out.trim_end().to_string())
        }
        RulesCommand::Template { name: Some(name) } => {
            Ok(format_rule_list(template(name)?.rules()))
        }
    }
}

fn check_rules(text: &str) -> Result<String> {
    let report = parse_rule_list(text);
    if report.is_empty() {
        return Ok("No rules".to_string());
    }

    let mut out = String::new();
    for rule in &report.valid {
        let _ = writeln!(out, "  ok       {:<7} {}", rule.kind.as_str(), rule.raw);
    }
    for invalid in &report.invalid {
        let _ = writeln!(out, "  invalid  {:<7} {}", "-", invalid);
    }

    if !report.is_clean() {
        bail!(
            "{} of {} rule(s) invalid:\n{}",
            report.invalid.len(),
            report.len(),
            out.trim_end()
        );
    }

    let _ = write!(out, "Normalized: {}", format_rule_list(&report.raw_rules()));
    Ok(out)
}
