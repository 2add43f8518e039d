//! In-memory stand-in for the kernel traffic-control subsystem
//!
//! [`FakeKernel`] answers the `ip`/`tc` command lines the mirror engine
//! issues the way iproute2 would, against a small model of links,
//! ingress qdiscs and u32 filters. Knobs inject the awkward cases: links
//! that show up late, tc without JSON support, failing commands, filters
//! that never become visible and filters that refuse to go away.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use lldp_mirror_common::{CommandRunner, ExecResult, MirrorResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::trace;

const TC_VERSION: &str = "tc utility, iproute2-6.1.0, libbpf 1.1.0";
const IP_VERSION: &str = "ip utility, iproute2-6.1.0, libbpf 1.1.0";
const FIRST_NODE: u32 = 0x800;

/// One installed u32 filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeFilter {
    pub priority: u16,
    pub handle: String,
    pub protocol: String,
    pub mirror_to: String,
    /// Left out of listings
    pub hidden: bool,
}

#[derive(Debug, Default)]
struct FakeLink {
    index: u32,
    peer: Option<String>,
    ingress: bool,
    filters: Vec<FakeFilter>,
    /// u32 hash table id per priority
    tables: HashMap<u16, u32>,
    next_node: HashMap<u16, u32>,
}

#[derive(Debug)]
struct KernelState {
    links: BTreeMap<String, FakeLink>,
    /// Links that appear after this many more link listings
    pending: HashMap<String, u32>,
    next_index: u32,
    json: bool,
    tools: bool,
    failing: Vec<String>,
    ghost: HashSet<String>,
    sticky: HashSet<String>,
    mislabeled: HashSet<String>,
    log: Vec<String>,
}

impl KernelState {
    fn add_link(&mut self, name: &str) {
        if self.links.contains_key(name) {
            return;
        }
        self.next_index += 1;
        let peer = name.starts_with("veth").then(|| format!("if{}", self.next_index + 100));
        self.links.insert(
            name.to_string(),
            FakeLink {
                index: self.next_index,
                peer,
                ..FakeLink::default()
            },
        );
    }
}

/// Fake `ip`/`tc` implementing [`CommandRunner`]
pub struct FakeKernel {
    state: Mutex<KernelState>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// A host with only `lo`, JSON-capable tc and both tools installed
    pub fn new() -> Self {
        let mut state = KernelState {
            links: BTreeMap::new(),
            pending: HashMap::new(),
            next_index: 0,
            json: true,
            tools: true,
            failing: Vec::new(),
            ghost: HashSet::new(),
            sticky: HashSet::new(),
            mislabeled: HashSet::new(),
            log: Vec::new(),
        };
        state.add_link("lo");
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_interfaces<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        {
            let mut state = self.state.lock();
            for name in names {
                state.add_link(name.as_ref());
            }
        }
        self
    }

    /// tc ignores `-j` and prints text, like iproute2 before JSON support
    pub fn without_json(self) -> Self {
        self.state.lock().json = false;
        self
    }

    /// `tc -V` and `ip -V` fail as if the tools were not installed
    pub fn missing_tools(self) -> Self {
        self.state.lock().tools = false;
        self
    }

    /// `name` shows up after `listings` link listings
    pub fn appear_after(self, name: &str, listings: u32) -> Self {
        self.state.lock().pending.insert(name.to_string(), listings);
        self
    }

    /// Every command containing `pattern` (unquoted form) fails
    pub fn fail_commands_containing(&self, pattern: &str) {
        self.state.lock().failing.push(pattern.to_string());
    }

    /// Clears injected command failures
    pub fn stop_failing(&self) {
        self.state.lock().failing.clear();
    }

    /// Filters added on `dev` are installed but never listed
    pub fn ghost_filters_on(&self, dev: &str) {
        self.state.lock().ghost.insert(dev.to_string());
    }

    /// Deletes on `dev` report success but leave the filter in place
    pub fn sticky_filters_on(&self, dev: &str) {
        self.state.lock().sticky.insert(dev.to_string());
    }

    /// Filters added on `dev` are listed with protocol `ip`, so they are
    /// found by handle but never count as LLDP mirrors
    pub fn mislabel_filters_on(&self, dev: &str) {
        self.state.lock().mislabeled.insert(dev.to_string());
    }

    /// Installs a mirror filter as some other tool would
    pub fn add_foreign_mirror(&self, from: &str, to: &str, priority: u16) -> String {
        let mut state = self.state.lock();
        let link = state.links.get_mut(from).expect("foreign mirror on unknown link");
        link.ingress = true;
        install_filter(link, priority, "lldp", to, false)
    }

    /// Removes a link together with its qdiscs and filters
    pub fn remove_interface(&self, name: &str) {
        self.state.lock().links.remove(name);
    }

    pub fn has_interface(&self, name: &str) -> bool {
        self.state.lock().links.contains_key(name)
    }

    pub fn has_ingress(&self, name: &str) -> bool {
        self.state
            .lock()
            .links
            .get(name)
            .map_or(false, |l| l.ingress)
    }

    /// All filters on `dev`, hidden ones included
    pub fn filters(&self, dev: &str) -> Vec<FakeFilter> {
        self.state
            .lock()
            .links
            .get(dev)
            .map(|l| l.filters.clone())
            .unwrap_or_default()
    }

    /// Destinations `dev` mirrors to
    pub fn mirrors(&self, dev: &str) -> Vec<String> {
        self.filters(dev).into_iter().map(|f| f.mirror_to).collect()
    }

    pub fn filter_count(&self) -> usize {
        self.state.lock().links.values().map(|l| l.filters.len()).sum()
    }

    /// Every command seen, quotes stripped
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Commands that would change kernel state
    pub fn mutating_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(" add ") || c.contains(" del "))
            .collect()
    }

    pub fn delete_commands(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(" filter del "))
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    fn execute(&self, cmd: &str) -> ExecResult {
        let args = tokenize(cmd);
        let line = args.join(" ");
        trace!(command = %line, "fake kernel");

        let mut state = self.state.lock();
        state.log.push(line.clone());

        if state.failing.iter().any(|p| line.contains(p.as_str())) {
            return ExecResult::failed(2, "Error: injected failure.");
        }

        let Some((tool, rest)) = args.split_first() else {
            return ExecResult::failed(127, "sh: empty command");
        };
        let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
        match tool.rsplit('/').next().unwrap_or(tool.as_str()) {
            "tc" => tc(&mut state, &rest),
            "ip" => ip(&mut state, &rest),
            other => ExecResult::failed(127, format!("sh: 1: {}: not found", other)),
        }
    }
}

#[async_trait]
impl CommandRunner for FakeKernel {
    async fn run(&self, cmd: &str) -> MirrorResult<ExecResult> {
        Ok(self.execute(cmd))
    }
}

/// Splits a command line, dropping the double quotes `shellquote` adds
fn tokenize(cmd: &str) -> Vec<String> {
    cmd.split_whitespace()
        .map(|t| t.trim_matches('"').replace("\\$", "$"))
        .collect()
}

fn no_device(dev: &str) -> ExecResult {
    ExecResult::failed(1, format!("Cannot find device \"{}\"", dev))
}

fn value_after<'a>(args: &[&'a str], key: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| *a == key)
        .and_then(|i| args.get(i + 1))
        .copied()
}

fn ip(state: &mut KernelState, args: &[&str]) -> ExecResult {
    if !state.tools {
        return ExecResult::failed(127, "sh: 1: ip: not found");
    }
    match args {
        ["-V"] => ExecResult::ok(IP_VERSION),
        ["-o", "link", "show"] => {
            let mut ready = Vec::new();
            for (name, left) in state.pending.iter_mut() {
                if *left == 0 {
                    ready.push(name.clone());
                } else {
                    *left -= 1;
                }
            }
            for name in ready {
                state.pending.remove(&name);
                state.add_link(&name);
            }
            let mut links: Vec<(&String, &FakeLink)> = state.links.iter().collect();
            links.sort_by_key(|(_, l)| l.index);
            let out: Vec<String> = links
                .into_iter()
                .map(|(name, link)| {
                    let name = match &link.peer {
                        Some(peer) => format!("{}@{}", name, peer),
                        None => name.clone(),
                    };
                    format!(
                        "{}: {}: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP mode DEFAULT group default qlen 1000\\    link/ether 02:00:00:00:00:{:02x} brd ff:ff:ff:ff:ff:ff",
                        link.index, name, link.index
                    )
                })
                .collect();
            ExecResult::ok(out.join("\n"))
        }
        _ => ExecResult::failed(255, "Object \"link\" is unknown, try \"ip help\"."),
    }
}

fn tc(state: &mut KernelState, args: &[&str]) -> ExecResult {
    if !state.tools {
        return ExecResult::failed(127, "sh: 1: tc: not found");
    }
    let (json, args) = match args.split_first() {
        Some((&"-j", rest)) => (true, rest),
        _ => (false, args),
    };

    match args {
        ["-V"] => ExecResult::ok(TC_VERSION),
        ["qdisc", "show", "dev", "lo"] => {
            if json && state.json {
                ExecResult::ok(r#"[{"kind":"noqueue","handle":"0:","root":true,"refcnt":2,"options":{}}]"#)
            } else {
                ExecResult::ok("qdisc noqueue 0: root refcnt 2")
            }
        }
        ["qdisc", "show", "dev", dev, "ingress"] => match state.links.get(*dev) {
            None => no_device(dev),
            Some(link) if link.ingress => {
                ExecResult::ok("qdisc ingress ffff: parent ffff:fff1 ----------------")
            }
            Some(_) => ExecResult::ok(""),
        },
        ["qdisc", "add", "dev", dev, "ingress"] => match state.links.get_mut(*dev) {
            None => no_device(dev),
            Some(link) if link.ingress => {
                ExecResult::failed(2, "Error: Exclusivity flag on, cannot modify.")
            }
            Some(link) => {
                link.ingress = true;
                ExecResult::ok("")
            }
        },
        ["filter", "add", "dev", dev, rest @ ..] => filter_add(state, dev, rest),
        ["filter", "show", "dev", dev, "parent", "ffff:"] => match state.links.get(*dev) {
            None => no_device(dev),
            Some(link) => {
                let visible: Vec<&FakeFilter> = link.filters.iter().filter(|f| !f.hidden).collect();
                if json && state.json {
                    ExecResult::ok(render_json(&visible))
                } else {
                    ExecResult::ok(render_text(&visible))
                }
            }
        },
        ["filter", "del", "dev", dev, rest @ ..] => filter_del(state, dev, rest),
        _ => ExecResult::failed(
            255,
            format!("Command \"{}\" is unknown, try \"tc help\".", args.join(" ")),
        ),
    }
}

fn filter_add(state: &mut KernelState, dev: &str, args: &[&str]) -> ExecResult {
    let (Some(priority), Some(protocol), Some(to)) = (
        value_after(args, "prio").and_then(|p| p.parse::<u16>().ok()),
        value_after(args, "protocol"),
        value_after(args, "dev"),
    ) else {
        return ExecResult::failed(255, "Illegal \"filter\"");
    };
    if !state.links.contains_key(to) {
        return no_device(to);
    }
    let hidden = state.ghost.contains(dev);
    let protocol = match protocol {
        _ if state.mislabeled.contains(dev) => "ip",
        "0x88cc" => "lldp",
        other => other,
    };
    let Some(link) = state.links.get_mut(dev) else {
        return no_device(dev);
    };
    if !link.ingress {
        return ExecResult::failed(2, "Error: Parent Qdisc doesn't exists.");
    }
    install_filter(link, priority, protocol, to, hidden);
    ExecResult::ok("")
}

fn install_filter(
    link: &mut FakeLink,
    priority: u16,
    protocol: &str,
    to: &str,
    hidden: bool,
) -> String {
    let next_table = FIRST_NODE + link.tables.len() as u32;
    let table = *link.tables.entry(priority).or_insert(next_table);
    let node = link.next_node.entry(priority).or_insert(FIRST_NODE);
    let handle = format!("{:x}::{:x}", table, *node);
    *node += 1;
    link.filters.push(FakeFilter {
        priority,
        handle: handle.clone(),
        protocol: protocol.to_string(),
        mirror_to: to.to_string(),
        hidden,
    });
    handle
}

fn filter_del(state: &mut KernelState, dev: &str, args: &[&str]) -> ExecResult {
    let sticky = state.sticky.contains(dev);
    let Some(link) = state.links.get_mut(dev) else {
        return no_device(dev);
    };
    let priority = value_after(args, "prio").and_then(|p| p.parse::<u16>().ok());
    let handle = value_after(args, "handle");
    let (Some(priority), Some(handle)) = (priority, handle) else {
        return ExecResult::failed(2, "Error: Filter handle is required.");
    };
    let Some(pos) = link
        .filters
        .iter()
        .position(|f| f.priority == priority && f.handle == handle)
    else {
        return ExecResult::failed(2, "Error: Filter with specified priority/protocol not found.");
    };
    if !sticky {
        link.filters.remove(pos);
    }
    ExecResult::ok("")
}

fn protocol_number(protocol: &str) -> &str {
    if protocol == "lldp" {
        "[35020]"
    } else {
        protocol
    }
}

fn render_text(filters: &[&FakeFilter]) -> String {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for f in filters {
        let head = format!(
            "filter parent ffff: protocol {} pref {} u32 chain 0",
            protocol_number(&f.protocol),
            f.priority
        );
        let table = f.handle.split("::").next().unwrap_or("800");
        if seen.insert(f.priority) {
            out.push(format!("{} ", head));
            out.push(format!("{} fh {}: ht divisor 1 ", head, table));
        }
        out.push(format!(
            "{} fh {} order {} key ht {} bkt 0 terminal flowid not_in_hw ",
            head,
            f.handle,
            u32::from_str_radix(f.handle.rsplit("::").next().unwrap_or("800"), 16).unwrap_or(0),
            table
        ));
        out.push("  match 00000000/00000000 at 0".to_string());
        out.push(format!(
            "\taction order 1: mirred (Egress Mirror to device {}) pipe",
            f.mirror_to
        ));
        out.push("\tindex 1 ref 1 bind 1".to_string());
        out.push(String::new());
    }
    out.join("\n")
}

fn render_json(filters: &[&FakeFilter]) -> String {
    let mut out: Vec<Value> = Vec::new();
    let mut seen = HashSet::new();
    for f in filters {
        let table = f.handle.split("::").next().unwrap_or("800");
        if seen.insert(f.priority) {
            out.push(json!({
                "parent": "ffff:", "protocol": f.protocol, "pref": f.priority,
                "kind": "u32", "chain": 0
            }));
            out.push(json!({
                "parent": "ffff:", "protocol": f.protocol, "pref": f.priority,
                "kind": "u32", "chain": 0,
                "options": { "fh": format!("{}:", table), "ht_divisor": 1 }
            }));
        }
        out.push(json!({
            "parent": "ffff:", "protocol": f.protocol, "pref": f.priority,
            "kind": "u32", "chain": 0,
            "options": {
                "fh": f.handle,
                "key_ht": table,
                "bkt": "0",
                "terminal": true,
                "not_in_hw": true,
                "match": { "value": "0", "mask": "0", "offmask": "", "off": 0 },
                "actions": [{
                    "order": 1,
                    "kind": "mirred",
                    "mirred_action": "mirror",
                    "direction": "egress",
                    "to_dev": f.mirror_to,
                    "control_action": { "type": "pipe" },
                    "index": 1, "ref": 1, "bind": 1
                }]
            }
        }));
    }
    Value::Array(out).to_string()
}
