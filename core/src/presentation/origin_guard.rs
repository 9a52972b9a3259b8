// Copyright (c) 2026 sandboxd contributors
// SPDX-License-Identifier: AGPL-3.0
//! Origin guard for spawn-bearing endpoints (spec §4.G "Origin guard",
//! Design Note §9 item 3).
//!
//! The original's IP check used `ip_network(cidr) or "127.0.0.1"`, a dead
//! fallback branch that could never run. This compares the client address
//! against every configured CIDR plus an explicit loopback CIDR when
//! `trust_loopback` is enabled.

use std::net::IpAddr;

use ipnetwork::IpNetwork;

pub struct OriginGuard {
    public_spawn_enabled: bool,
    host_allowlist: Vec<String>,
    ip_allowlist: Vec<IpNetwork>,
    trust_loopback: bool,
}

impl OriginGuard {
    pub fn new(
        public_spawn_enabled: bool,
        host_allowlist: Vec<String>,
        ip_allowlist: Vec<IpNetwork>,
        trust_loopback: bool,
    ) -> Self {
        Self {
            public_spawn_enabled,
            host_allowlist,
            ip_allowlist,
            trust_loopback,
        }
    }

    /// `true` if the request may proceed: either spawning is public, or the
    /// caller's host header is in the allowlist, or its IP falls within an
    /// allow-listed CIDR (including loopback, if trusted).
    pub fn allows(&self, host_header: Option<&str>, client_ip: IpAddr) -> bool {
        if self.public_spawn_enabled {
            return true;
        }

        if let Some(host) = host_header {
            if self.host_allowlist.iter().any(|h| h == host) {
                return true;
            }
        }

        if self.ip_allowlist.iter().any(|net| net.contains(client_ip)) {
            return true;
        }

        if self.trust_loopback && is_loopback_cidr_match(client_ip) {
            return true;
        }

        false
    }
}

fn is_loopback_cidr_match(ip: IpAddr) -> bool {
    const V4_LOOPBACK: &str = "127.0.0.0/8";
    const V6_LOOPBACK: &str = "::1/128";

    let loopback_v4: IpNetwork = V4_LOOPBACK.parse().expect("static CIDR literal");
    let loopback_v6: IpNetwork = V6_LOOPBACK.parse().expect("static CIDR literal");
    loopback_v4.contains(ip) || loopback_v6.contains(ip)
}
