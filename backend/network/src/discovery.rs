//! Host link discovery and isolation target selection.

use once_cell::sync::Lazy;
use regex::Regex;

/// Always excluded from auto-discovery.
pub const LOOPBACK: &str = "lo";

static LINK_LINE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+:\s+([^:@\s]+)(?:@[^:\s]+)?:\s+<([^>]*)>").unwrap());

/// A link as printed by `ip -o link show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub name: String,
    pub flags: Vec<String>,
}

impl LinkInfo {
    /// Administratively up (the `UP` flag, not carrier state).
    pub fn is_up(&self) -> bool {
        self.flags.iter().any(|f| f == "UP")
    }
}

/// Parse `ip -o link show` output. `veth0@if3` is reported as `veth0`.
pub fn parse_link_list(raw: &str) -> Vec<LinkInfo> {
    raw.lines()
        .filter_map(|line| {
            let caps = LINK_LINE_RE.captures(line)?;
            Some(LinkInfo {
                name: caps[1].to_string(),
                flags: caps[2]
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect(),
            })
        })
        .collect()
}

/// Choose which links to bring down. An explicit override is used verbatim;
/// otherwise every discovered link except loopback and names starting with an
/// excluded prefix (container bridges).
pub fn select_targets(
    discovered: &[String],
    explicit: Option<&[String]>,
    excluded_prefixes: &[String],
) -> Vec<String> {
    if let Some(explicit) = explicit {
        let mut targets: Vec<String> = Vec::with_capacity(explicit.len());
        for name in explicit {
            if !targets.contains(name) {
                targets.push(name.clone());
            }
        }
        return targets;
    }

    discovered
        .iter()
        .filter(|name| name.as_str() != LOOPBACK)
        .filter(|name| !excluded_prefixes.iter().any(|p| name.starts_with(p.as_str())))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn auto_discovery_excludes_loopback_and_docker() {
        let discovered = names(&["lo", "eth0", "docker0", "wlan0"]);
        let targets = select_targets(&discovered, None, &names(&["docker"]));
        assert_eq!(targets, names(&["eth0", "wlan0"]));
    }

    #[test]
    fn explicit_override_wins() {
        let discovered = names(&["lo", "eth0", "wlan0"]);
        let explicit = names(&["wlan0", "wlan0", "docker0"]);
        let targets = select_targets(&discovered, Some(&explicit), &names(&["docker"]));
        assert_eq!(targets, names(&["wlan0", "docker0"]));
    }

    #[test]
    fn parses_ip_link_output() {
        let raw = "\
1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN mode DEFAULT
2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq_codel state UP mode DEFAULT
3: wlan0: <BROADCAST,MULTICAST> mtu 1500 qdisc noop state DOWN mode DORMANT
7: veth1a2b@if6: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue master docker0
";
        let links = parse_link_list(raw);
        let found: Vec<_> = links.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(found, vec!["lo", "eth0", "wlan0", "veth1a2b"]);
        assert!(links[1].is_up());
        assert!(!links[2].is_up());
    }
}
