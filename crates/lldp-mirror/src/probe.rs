//! Running-state probing
//!
//! Reads the ingress filters of a set of interfaces and reports which
//! interfaces each one mirrors LLDP frames to. `tc` output comes in two
//! shapes: JSON (`tc -j`, preferred) and the classic text listing. Which
//! one is used is decided once per run by [`OutputFormat::negotiate`];
//! both normalize to the same [`MirrorFilter`] list.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use lldp_mirror_common::{CommandRunner, MirrorError, MirrorResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::commands::TcCommands;
use crate::types::RunningState;

/// Protocol spellings tc uses for the LLDP ethertype
const LLDP_PROTOCOL_NAMES: &[&str] = &["lldp", "0x88cc", "[35020]", "35020"];

/// One ingress filter as seen in a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorFilter {
    pub priority: u16,
    pub handle: String,
    /// Empty when the listing did not say
    pub protocol: String,
    /// Devices this filter mirrors frames to (egress mirror actions)
    pub destinations: Vec<String>,
}

impl MirrorFilter {
    pub fn is_lldp(&self) -> bool {
        self.protocol.is_empty() || LLDP_PROTOCOL_NAMES.contains(&self.protocol.as_str())
    }

    pub fn mirrors_to(&self, dev: &str) -> bool {
        self.destinations.iter().any(|d| d == dev)
    }

    pub fn matches(&self, priority: u16, handle: &str) -> bool {
        self.priority == priority && self.handle == handle
    }
}

/// Turns `tc filter show` output into filters
pub trait FilterParser: Send + Sync {
    /// Whether the listing must be requested with `-j`
    fn wants_json(&self) -> bool;

    fn parse(&self, output: &str) -> Result<Vec<MirrorFilter>, String>;
}

#[derive(Debug, Deserialize)]
struct JsonFilter {
    #[serde(default)]
    pref: Option<u32>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    options: Option<JsonFilterOptions>,
}

#[derive(Debug, Deserialize)]
struct JsonFilterOptions {
    #[serde(default)]
    fh: Option<String>,
    #[serde(default)]
    actions: Vec<JsonAction>,
}

#[derive(Debug, Deserialize)]
struct JsonAction {
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    mirred_action: Option<String>,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    to_dev: Option<String>,
}

impl JsonAction {
    fn egress_mirror_target(&self) -> Option<&str> {
        let is_mirror = self.kind.as_deref() == Some("mirred")
            && self.mirred_action.as_deref() == Some("mirror")
            && self.direction.as_deref().map_or(true, |d| d == "egress");
        if is_mirror {
            self.to_dev.as_deref()
        } else {
            None
        }
    }
}

/// Parser for `tc -j filter show`
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFilterParser;

impl FilterParser for JsonFilterParser {
    fn wants_json(&self) -> bool {
        true
    }

    fn parse(&self, output: &str) -> Result<Vec<MirrorFilter>, String> {
        if output.trim().is_empty() {
            return Ok(Vec::new());
        }
        let entries: Vec<JsonFilter> =
            serde_json::from_str(output).map_err(|e| format!("invalid filter JSON: {}", e))?;

        let mut filters = Vec::new();
        for entry in entries {
            // Entries without a handle are per-priority headers
            let (Some(pref), Some(options)) = (entry.pref, entry.options) else {
                continue;
            };
            let Some(handle) = options.fh else {
                continue;
            };
            let priority =
                u16::try_from(pref).map_err(|_| format!("priority {} out of range", pref))?;
            filters.push(MirrorFilter {
                priority,
                handle,
                protocol: entry.protocol.unwrap_or_default(),
                destinations: options
                    .actions
                    .iter()
                    .filter_map(|a| a.egress_mirror_target())
                    .map(str::to_string)
                    .collect(),
            });
        }
        Ok(filters)
    }
}

static PREF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bpref (\d+)\b").expect("Invalid regex pattern"));
static FH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bfh (\S+)").expect("Invalid regex pattern"));
static PROTOCOL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bprotocol (\S+)").expect("Invalid regex pattern"));
static MIRROR_TO_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"mirred \(Egress Mirror to device ([^)\s]+)\)").expect("Invalid regex pattern")
});

/// Parser for the plain `tc filter show` listing
///
/// ```text
/// filter parent ffff: protocol [35020] pref 20000 u32 chain 0 fh 800::800 order 2048 key ht 800 bkt 0
///   match 00000000/00000000 at 0
///     action order 1: mirred (Egress Mirror to device tap100i0) pipe
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct TextFilterParser;

impl FilterParser for TextFilterParser {
    fn wants_json(&self) -> bool {
        false
    }

    fn parse(&self, output: &str) -> Result<Vec<MirrorFilter>, String> {
        let mut filters = Vec::new();
        let mut current: Option<MirrorFilter> = None;

        for line in output.lines() {
            let trimmed = line.trim();
            if trimmed.starts_with("filter ") {
                filters.extend(current.take());

                let Some(handle) = FH_RE.captures(trimmed).map(|c| c[1].to_string()) else {
                    continue;
                };
                let priority = match PREF_RE.captures(trimmed) {
                    Some(c) => c[1]
                        .parse::<u16>()
                        .map_err(|_| format!("bad priority in line: {}", trimmed))?,
                    None => return Err(format!("filter line without pref: {}", trimmed)),
                };
                current = Some(MirrorFilter {
                    priority,
                    handle,
                    protocol: PROTOCOL_RE
                        .captures(trimmed)
                        .map(|c| c[1].to_string())
                        .unwrap_or_default(),
                    destinations: Vec::new(),
                });
            } else if let Some(caps) = MIRROR_TO_RE.captures(trimmed) {
                if let Some(filter) = current.as_mut() {
                    filter.destinations.push(caps[1].to_string());
                }
            }
        }
        filters.extend(current);

        Ok(filters)
    }
}

/// Which listing format this run uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
}

impl OutputFormat {
    /// Asks tc once whether it can emit JSON
    pub async fn negotiate(runner: &dyn CommandRunner, commands: &TcCommands) -> Self {
        let cmd = commands.json_probe();
        match runner.run(&cmd).await {
            Ok(result)
                if result.success()
                    && serde_json::from_str::<serde_json::Value>(&result.stdout)
                        .map(|v| v.is_array())
                        .unwrap_or(false) =>
            {
                OutputFormat::Json
            }
            Ok(_) => OutputFormat::Text,
            Err(e) => {
                warn!(error = %e, "JSON capability probe could not run, using text output");
                OutputFormat::Text
            }
        }
    }

    pub fn parser(&self) -> Box<dyn FilterParser> {
        match self {
            OutputFormat::Json => Box::new(JsonFilterParser),
            OutputFormat::Text => Box::new(TextFilterParser),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Text => write!(f, "text"),
        }
    }
}

/// Extracts link names from `ip -o link show`
pub fn parse_link_names(output: &str) -> HashSet<String> {
    output
        .lines()
        .filter_map(|line| line.split(": ").nth(1))
        .map(|name| name.split('@').next().unwrap_or(name).trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}

/// Read-only view of kernel mirror state
pub struct Prober {
    runner: Arc<dyn CommandRunner>,
    commands: TcCommands,
    format: OutputFormat,
    parser: Box<dyn FilterParser>,
}

impl Prober {
    /// Creates a prober, probing tc once for JSON support
    pub async fn negotiate(runner: Arc<dyn CommandRunner>, commands: TcCommands) -> Self {
        let format = OutputFormat::negotiate(runner.as_ref(), &commands).await;
        info!(format = %format, "Selected tc output format");
        Self::with_format(runner, commands, format)
    }

    pub fn with_format(
        runner: Arc<dyn CommandRunner>,
        commands: TcCommands,
        format: OutputFormat,
    ) -> Self {
        Self {
            runner,
            commands,
            format,
            parser: format.parser(),
        }
    }

    pub fn commands(&self) -> &TcCommands {
        &self.commands
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Names of all links currently on the host
    pub async fn links(&self) -> MirrorResult<HashSet<String>> {
        let cmd = self.commands.link_list();
        let output = self.runner.run_or_throw(&cmd).await?;
        Ok(parse_link_names(&output))
    }

    pub async fn interface_exists(&self, dev: &str) -> MirrorResult<bool> {
        Ok(self.links().await?.contains(dev))
    }

    /// Ingress filters of `dev`, or `None` if the device does not exist
    pub async fn filters(&self, dev: &str) -> MirrorResult<Option<Vec<MirrorFilter>>> {
        if !self.interface_exists(dev).await? {
            return Ok(None);
        }
        self.list_filters(dev).await.map(Some)
    }

    async fn list_filters(&self, dev: &str) -> MirrorResult<Vec<MirrorFilter>> {
        let cmd = self.commands.show_filters(dev, self.parser.wants_json());
        let output = self.runner.run_or_throw(&cmd).await?;
        self.parser
            .parse(&output)
            .map_err(|message| MirrorError::parse_output(cmd, message))
    }

    /// Snapshot of LLDP mirror destinations for the existing interfaces
    /// among `interfaces`
    ///
    /// Interfaces that do not exist are left out. An interface whose
    /// listing fails is left out too, with a warning.
    pub async fn query<'a, I>(&self, interfaces: I) -> MirrorResult<RunningState>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let links = self.links().await?;
        let mut running = RunningState::new();

        for dev in interfaces {
            if !links.contains(dev) {
                debug!(interface = dev, "Interface absent, not queried");
                continue;
            }
            match self.list_filters(dev).await {
                Ok(filters) => {
                    let destinations: Vec<String> = filters
                        .into_iter()
                        .filter(MirrorFilter::is_lldp)
                        .flat_map(|f| f.destinations)
                        .collect();
                    running.insert(dev, destinations);
                }
                Err(e) => warn!(interface = dev, error = %e, "Failed to list filters"),
            }
        }

        Ok(running)
    }
}
