//! Service primitives: port ranges and TCP flag sets.

use serde::{Deserialize, Serialize};

/// Inclusive port range. `0..=0` means "any port".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn any() -> Self {
        Self { start: 0, end: 0 }
    }

    pub fn is_any(&self) -> bool {
        self.start == 0 && self.end == 0
    }

    pub fn is_single(&self) -> bool {
        self.start == self.end
    }

    /// Render for iptables: `22` or `22:80`.
    pub fn to_ipt(&self) -> String {
        if self.is_single() {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        }
    }

    /// Render for nftables: `22` or `22-80`.
    pub fn to_nft(&self) -> String {
        if self.is_single() {
            self.start.to_string()
        } else {
            format!("{}-{}", self.start, self.end)
        }
    }
}

/// Parse "22" or "22-80" / "22:80".
pub fn parse_port_range(s: &str) -> Option<PortRange> {
    let s = s.trim();
    if s.is_empty() || s == "any" {
        return Some(PortRange::any());
    }
    if let Some((a, b)) = s.split_once(['-', ':']) {
        let start = a.trim().parse().ok()?;
        let end = b.trim().parse().ok()?;
        (start <= end).then_some(PortRange { start, end })
    } else {
        s.parse().ok().map(PortRange::single)
    }
}

/// TCP flag bit set for `--tcp-flags MASK SET` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn from_names(names: &[String]) -> Self {
        let mut bits = 0u8;
        for name in names {
            bits |= match name.to_ascii_uppercase().as_str() {
                "FIN" => Self::FIN,
                "SYN" => Self::SYN,
                "RST" => Self::RST,
                "PSH" => Self::PSH,
                "ACK" => Self::ACK,
                "URG" => Self::URG,
                "ALL" => 0x3f,
                _ => 0,
            };
        }
        TcpFlags(bits)
    }

    /// Render as iptables flag list: `SYN,ACK` (or `ALL`/`NONE`).
    pub fn to_ipt(&self) -> String {
        if self.0 == 0x3f {
            return "ALL".into();
        }
        if self.0 == 0 {
            return "NONE".into();
        }
        let mut parts = Vec::new();
        for (bit, name) in [
            (Self::FIN, "FIN"),
            (Self::SYN, "SYN"),
            (Self::RST, "RST"),
            (Self::PSH, "PSH"),
            (Self::ACK, "ACK"),
            (Self::URG, "URG"),
        ] {
            if self.0 & bit != 0 {
                parts.push(name);
            }
        }
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_parsing() {
        assert_eq!(parse_port_range("22"), Some(PortRange::single(22)));
        assert_eq!(
            parse_port_range("1024-2048"),
            Some(PortRange {
                start: 1024,
                end: 2048
            })
        );
        assert_eq!(parse_port_range("any"), Some(PortRange::any()));
        assert_eq!(parse_port_range("9-2"), None);
    }

    #[test]
    fn tcp_flags_render() {
        let f = TcpFlags::from_names(&["SYN".into(), "ACK".into()]);
        assert_eq!(f.to_ipt(), "SYN,ACK");
        assert_eq!(TcpFlags(0x3f).to_ipt(), "ALL");
        assert_eq!(TcpFlags(0).to_ipt(), "NONE");
    }
}
