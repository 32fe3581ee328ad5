//! Traffic-control command builders
//!
//! Every gateway interface carries a root `htb` qdisc. Each link rule gets
//! its own `htb` class on the destination interface, keyed by the source
//! cluster, with a `netem` child for delay/jitter/loss and a `u32` filter
//! that steers the source cluster's traffic into it. All commands use
//! `replace`, so re-running them converges instead of stacking.

use crate::models::WanParams;
use crate::network::Subnet;

/// Rate of classes that have no bandwidth cap
const LINE_RATE: &str = "10gbit";
/// Class minor of the default (unshaped) class
const DEFAULT_MINOR: u32 = 0x1;
/// First class minor handed to link rules
const FIRST_RULE_MINOR: u32 = 0x10;
const FILTER_PRIO: &str = "1";

/// Class minor used for traffic coming from the cluster at `source_index`
pub fn class_minor(source_index: usize) -> u32 {
    FIRST_RULE_MINOR + source_index as u32
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Commands that give an interface a root `htb` qdisc with an unshaped default class
pub fn root_commands(interface: &str) -> Vec<Vec<String>> {
    let default_class = format!("1:{:x}", DEFAULT_MINOR);
    let default_minor = format!("{:x}", DEFAULT_MINOR);
    vec![
        args(&[
            "tc", "qdisc", "replace", "dev", interface, "root", "handle", "1:", "htb", "default",
            &default_minor,
        ]),
        args(&[
            "tc", "class", "replace", "dev", interface, "parent", "1:", "classid", &default_class,
            "htb", "rate", LINE_RATE,
        ]),
    ]
}

/// netem options for a set of WAN parameters
pub fn netem_options(params: &WanParams) -> Vec<String> {
    let mut opts = vec!["delay".to_string(), format!("{}ms", params.latency_ms)];
    if params.jitter_ms > 0 {
        opts.push(format!("{}ms", params.jitter_ms));
    }
    if params.loss_pct > 0.0 {
        opts.push("loss".to_string());
        opts.push(format!("{}%", params.loss_pct));
    }
    opts
}

/// Commands that shape traffic from `source` arriving on `interface`
pub fn shaping_commands(
    interface: &str,
    source_index: usize,
    source: &Subnet,
    params: &WanParams,
) -> Vec<Vec<String>> {
    let minor = class_minor(source_index);
    let classid = format!("1:{:x}", minor);
    let handle = format!("{:x}:", minor);
    let filter_handle = format!("800::{:x}", minor);
    let rate = params
        .bandwidth_kbps
        .map(|kbps| format!("{}kbit", kbps))
        .unwrap_or_else(|| LINE_RATE.to_string());
    let source = source.to_string();

    let mut netem = args(&[
        "tc", "qdisc", "replace", "dev", interface, "parent", &classid, "handle", &handle, "netem",
    ]);
    netem.extend(netem_options(params));

    vec![
        args(&[
            "tc", "class", "replace", "dev", interface, "parent", "1:", "classid", &classid, "htb",
            "rate", &rate, "ceil", &rate,
        ]),
        netem,
        args(&[
            "tc", "filter", "replace", "dev", interface, "parent", "1:", "protocol", "ip", "prio",
            FILTER_PRIO, "handle", &filter_handle, "u32", "match", "ip", "src", &source, "flowid",
            &classid,
        ]),
    ]
}

/// Route a node uses to reach another cluster through the gateway
pub fn route_command(destination: &Subnet, via: &str) -> Vec<String> {
    let destination = destination.to_string();
    args(&["ip", "route", "replace", &destination, "via", via])
}
