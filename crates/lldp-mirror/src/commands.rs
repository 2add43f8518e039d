//! Command builders for tc/ip operations

use lldp_mirror_common::shell::{self, shellquote};

/// Ingress qdisc parent all mirror filters hang off
pub const INGRESS_PARENT: &str = "ffff:";

/// LLDP ethertype
pub const LLDP_PROTOCOL: &str = "0x88cc";

/// Builds the command lines for one tc/ip installation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcCommands {
    tc: String,
    ip: String,
}

impl Default for TcCommands {
    fn default() -> Self {
        Self::new(shell::TC_CMD, shell::IP_CMD)
    }
}

impl TcCommands {
    pub fn new(tc: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            tc: tc.into(),
            ip: ip.into(),
        }
    }

    /// Tool presence checks
    pub fn version_checks(&self) -> [String; 2] {
        [format!("{} -V", self.tc), format!("{} -V", self.ip)]
    }

    /// Probe for JSON output support
    pub fn json_probe(&self) -> String {
        format!("{} -j qdisc show dev lo", self.tc)
    }

    /// One line per link, `<idx>: <name>[@<peer>]: <flags> ...`
    pub fn link_list(&self) -> String {
        format!("{} -o link show", self.ip)
    }

    pub fn show_ingress_qdisc(&self, dev: &str) -> String {
        format!("{} qdisc show dev {} ingress", self.tc, shellquote(dev))
    }

    pub fn add_ingress_qdisc(&self, dev: &str) -> String {
        format!("{} qdisc add dev {} ingress", self.tc, shellquote(dev))
    }

    /// Mirror LLDP frames arriving on `from` out of `to`
    pub fn add_mirror_filter(&self, from: &str, to: &str, priority: u16) -> String {
        format!(
            "{} filter add dev {} parent {} protocol {} prio {} u32 match u32 0 0 action mirred egress mirror dev {}",
            self.tc,
            shellquote(from),
            INGRESS_PARENT,
            LLDP_PROTOCOL,
            priority,
            shellquote(to)
        )
    }

    pub fn show_filters(&self, dev: &str, json: bool) -> String {
        format!(
            "{}{} filter show dev {} parent {}",
            self.tc,
            if json { " -j" } else { "" },
            shellquote(dev),
            INGRESS_PARENT
        )
    }

    /// Deletes exactly one filter, addressed by priority and handle
    pub fn del_filter(&self, dev: &str, priority: u16, handle: &str) -> String {
        format!(
            "{} filter del dev {} parent {} protocol {} prio {} handle {} u32",
            self.tc,
            shellquote(dev),
            INGRESS_PARENT,
            LLDP_PROTOCOL,
            priority,
            shellquote(handle)
        )
    }
}
