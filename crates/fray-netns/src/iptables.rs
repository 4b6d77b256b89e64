//! `iptables` argument builders for NAT redirects and partition drops.

/// Insert or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOp {
    Insert,
    Delete,
}

impl RuleOp {
    fn flag(self) -> &'static str {
        match self {
            RuleOp::Insert => "-I",
            RuleOp::Delete => "-D",
        }
    }
}

/// A `PREROUTING` redirect of a TCP port to a local listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub interface: String,
    pub from_port: u16,
    pub to_port: u16,
}

impl Redirect {
    /// `-t nat -I|-D PREROUTING -i IF -p tcp --dport FROM -j REDIRECT --to-port TO`
    pub fn args(&self, op: RuleOp) -> Vec<String> {
        vec![
            "-t".into(),
            "nat".into(),
            op.flag().into(),
            "PREROUTING".into(),
            "-i".into(),
            self.interface.clone(),
            "-p".into(),
            "tcp".into(),
            "--dport".into(),
            self.from_port.to_string(),
            "-j".into(),
            "REDIRECT".into(),
            "--to-port".into(),
            self.to_port.to_string(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    Input,
    Output,
}

/// A `DROP` rule isolating one peer in one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropRule {
    pub chain: Chain,
    pub peer: String,
}

impl DropRule {
    /// Both directions for `peer`: outbound to it, inbound from it.
    pub fn pair(peer: &str) -> [DropRule; 2] {
        [
            DropRule {
                chain: Chain::Output,
                peer: peer.to_string(),
            },
            DropRule {
                chain: Chain::Input,
                peer: peer.to_string(),
            },
        ]
    }

    /// `iptables` or `ip6tables`, by address family of the peer.
    pub fn program(&self) -> &'static str {
        if self.peer.contains(':') {
            "ip6tables"
        } else {
            "iptables"
        }
    }

    pub fn args(&self, op: RuleOp) -> Vec<String> {
        let (chain, dir) = match self.chain {
            Chain::Output => ("OUTPUT", "-d"),
            Chain::Input => ("INPUT", "-s"),
        };
        vec![
            op.flag().into(),
            chain.into(),
            dir.into(),
            self.peer.clone(),
            "-j".into(),
            "DROP".into(),
        ]
    }
}

/// Whether `iptables -D` stderr means the rule was already gone.
pub fn is_already_absent(stderr: &str) -> bool {
    stderr.contains("No chain/target/match by that name")
        || stderr.contains("Bad rule")
        || stderr.contains("does a matching rule exist")
}
