//! Firewall rule compilation.
//!
//! A VPC's declared rule set compiles into an `iptables-restore --noflush`
//! payload maintaining one inbound and one outbound chain. The output is
//! byte-stable for a given rule set: rules sort by `(priority, id)` and all
//! formatting is fixed, so the driver can compare digests and skip pushing
//! an unchanged script.

use std::fmt::Write;

use vdc_api_types::{FirewallDirection, FirewallProtocol, FirewallRule, Vpc};

/// Chain names derived from the VPC's stable chain token.
pub fn chain_names(vpc: &Vpc) -> (String, String) {
    (
        format!("vdc-{}-in", vpc.chain),
        format!("vdc-{}-out", vpc.chain),
    )
}

fn rule_match(rule: &FirewallRule) -> String {
    let mut out = format!("-p {}", rule.protocol);
    if rule.protocol != FirewallProtocol::Icmp {
        match (rule.port_start, rule.port_end) {
            (Some(start), Some(end)) if end != start => {
                let _ = write!(out, " --dport {start}:{end}");
            }
            (Some(start), _) => {
                let _ = write!(out, " --dport {start}");
            }
            (None, _) => (),
        }
    }
    match rule.direction {
        FirewallDirection::Inbound => {
            let _ = write!(out, " -s {}", rule.cidr);
        }
        FirewallDirection::Outbound => {
            let _ = write!(out, " -d {}", rule.cidr);
        }
    }
    out
}

/// Compile the rule set of one VPC into an iptables-restore payload.
///
/// Both chains accept established/related and intra-VPC traffic first, then
/// the declared rules in `(priority asc, id lex)` order, and drop everything
/// else.
pub fn compile(vpc: &Vpc, rules: &[FirewallRule]) -> String {
    let (chain_in, chain_out) = chain_names(vpc);

    let mut sorted: Vec<&FirewallRule> = rules.iter().filter(|r| r.vpc == vpc.name).collect();
    sorted.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });

    let mut script = String::new();
    script.push_str("*filter\n");
    let _ = writeln!(script, ":{chain_in} - [0:0]");
    let _ = writeln!(script, ":{chain_out} - [0:0]");
    let _ = writeln!(script, "-F {chain_in}");
    let _ = writeln!(script, "-F {chain_out}");

    for chain in [&chain_in, &chain_out] {
        let _ = writeln!(
            script,
            "-A {chain} -m state --state ESTABLISHED,RELATED -j ACCEPT"
        );
        let _ = writeln!(script, "-A {chain} -s {} -d {} -j ACCEPT", vpc.cidr, vpc.cidr);
    }

    for rule in &sorted {
        let chain = match rule.direction {
            FirewallDirection::Inbound => &chain_in,
            FirewallDirection::Outbound => &chain_out,
        };
        let _ = writeln!(script, "-A {chain} {} -j ACCEPT", rule_match(rule));
    }

    let _ = writeln!(script, "-A {chain_in} -j DROP");
    let _ = writeln!(script, "-A {chain_out} -j DROP");
    script.push_str("COMMIT\n");
    script
}

/// Content digest used for push-skipping; hex sha256 of the script bytes.
pub fn digest(script: &str) -> String {
    let hash = openssl::sha::sha256(script.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in hash {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use vdc_api_types::{Ipv4Cidr, Ulid};

    fn test_vpc() -> Vpc {
        let cidr: Ipv4Cidr = "10.0.0.0/24".parse().unwrap();
        Vpc {
            name: "v1".to_string(),
            cidr,
            subnets: Vec::new(),
            gateway: cidr.gateway(),
            mtu: 1500,
            chain: "ab12cd34".to_string(),
            created_at: 0,
        }
    }

    fn rule(
        id: Ulid,
        direction: FirewallDirection,
        protocol: FirewallProtocol,
        ports: Option<(u16, u16)>,
        cidr: &str,
        priority: u16,
    ) -> FirewallRule {
        FirewallRule {
            id,
            vpc: "v1".to_string(),
            direction,
            protocol,
            port_start: ports.map(|p| p.0),
            port_end: ports.map(|p| p.1),
            cidr: cidr.parse().unwrap(),
            description: String::new(),
            priority,
            created_at: 0,
        }
    }

    #[test]
    fn compilation_is_deterministic() {
        let vpc = test_vpc();
        let a = rule(
            Ulid::generate(),
            FirewallDirection::Inbound,
            FirewallProtocol::Tcp,
            Some((80, 80)),
            "0.0.0.0/0",
            1000,
        );
        let b = rule(
            Ulid::generate(),
            FirewallDirection::Outbound,
            FirewallProtocol::Udp,
            Some((53, 53)),
            "0.0.0.0/0",
            500,
        );

        let one = compile(&vpc, &[a.clone(), b.clone()]);
        let two = compile(&vpc, &[b, a]);
        assert_eq!(one, two);
        assert_eq!(digest(&one), digest(&two));
    }

    #[test]
    fn rules_sort_by_priority_then_id() {
        let vpc = test_vpc();
        let low = Ulid::from([0u8; 16]);
        let high = Ulid::from([0xffu8; 16]);

        let first = rule(
            high,
            FirewallDirection::Inbound,
            FirewallProtocol::Tcp,
            Some((22, 22)),
            "0.0.0.0/0",
            10,
        );
        let second = rule(
            low,
            FirewallDirection::Inbound,
            FirewallProtocol::Tcp,
            Some((80, 80)),
            "0.0.0.0/0",
            20,
        );
        let script = compile(&vpc, &[second.clone(), first.clone()]);
        let pos_22 = script.find("--dport 22").unwrap();
        let pos_80 = script.find("--dport 80").unwrap();
        assert!(pos_22 < pos_80);

        // same priority: id breaks the tie
        let mut tied = second;
        tied.priority = 10;
        let script = compile(&vpc, &[tied, first]);
        let pos_22 = script.find("--dport 22").unwrap();
        let pos_80 = script.find("--dport 80").unwrap();
        assert!(pos_80 < pos_22);
    }

    #[test]
    fn script_shape() {
        let vpc = test_vpc();
        let web = rule(
            Ulid::generate(),
            FirewallDirection::Inbound,
            FirewallProtocol::Tcp,
            Some((80, 80)),
            "0.0.0.0/0",
            1000,
        );
        let script = compile(&vpc, &[web]);

        assert!(script.starts_with("*filter\n"));
        assert!(script.ends_with("COMMIT\n"));
        assert!(script.contains(":vdc-ab12cd34-in - [0:0]"));
        assert!(script.contains("-A vdc-ab12cd34-in -p tcp --dport 80 -s 0.0.0.0/0 -j ACCEPT"));
        assert!(script.contains("-A vdc-ab12cd34-in -m state --state ESTABLISHED,RELATED -j ACCEPT"));
        assert!(script.contains("-A vdc-ab12cd34-in -s 10.0.0.0/24 -d 10.0.0.0/24 -j ACCEPT"));
        assert!(script.contains("-A vdc-ab12cd34-in -j DROP"));
        assert!(script.contains("-A vdc-ab12cd34-out -j DROP"));
    }

    #[test]
    fn port_ranges_and_icmp() {
        let vpc = test_vpc();
        let range = rule(
            Ulid::generate(),
            FirewallDirection::Inbound,
            FirewallProtocol::Tcp,
            Some((8000, 8080)),
            "192.0.2.0/24",
            100,
        );
        let ping = rule(
            Ulid::generate(),
            FirewallDirection::Inbound,
            FirewallProtocol::Icmp,
            None,
            "10.0.0.0/8",
            200,
        );
        let script = compile(&vpc, &[range, ping]);
        assert!(script.contains("--dport 8000:8080 -s 192.0.2.0/24"));
        assert!(script.contains("-p icmp -s 10.0.0.0/8 -j ACCEPT"));
    }

    #[test]
    fn foreign_vpc_rules_are_ignored() {
        let vpc = test_vpc();
        let mut foreign = rule(
            Ulid::generate(),
            FirewallDirection::Inbound,
            FirewallProtocol::Tcp,
            Some((80, 80)),
            "0.0.0.0/0",
            1000,
        );
        foreign.vpc = "other".to_string();
        let script = compile(&vpc, &[foreign]);
        assert!(!script.contains("--dport 80"));
    }
}
