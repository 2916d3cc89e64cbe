//! Rendering of the `hosts` inventory and `vars/all.yml`.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::model::HostGroups;

/// INI inventory: one section per group, one line per host.
pub fn render_inventory(groups: &HostGroups) -> String {
    let mut out = String::new();
    for (group, hosts) in groups {
        if !out.is_empty() {
            out.push('\n');
        }
        let _ = writeln!(out, "[{group}]");
        for host in hosts {
            let _ = writeln!(
                out,
                "{} ansible_ssh_port={} ansible_ssh_user={}",
                host.address, host.port, host.user
            );
        }
    }
    out
}

/// Flat `key: value` YAML. Values are emitted as double-quoted scalars.
pub fn render_vars(vars: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in vars {
        let quoted = serde_json::to_string(value).unwrap_or_else(|_| format!("\"{value}\""));
        let _ = writeln!(out, "{key}: {quoted}");
    }
    out
}
