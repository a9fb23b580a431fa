use serde::{Deserialize, Serialize};

/// A destination a stream wants to reach, as carried in a relay BEGIN
/// payload and produced by the SOCKS handshake.
///
/// Rendered as `host:port`. The host part is kept as a string; name
/// resolution happens at the exit, never at the entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string.
    ///
    /// Rejects an empty host, a missing `:` separator, and a port that is
    /// absent, non-numeric, or zero.
    pub fn parse(s: &str) -> Result<Self, TargetAddrError> {
        let colon = s.find(':').ok_or(TargetAddrError::MissingSeparator)?;
        let (host, port) = (&s[..colon], &s[colon + 1..]);

        if host.is_empty() {
            return Err(TargetAddrError::EmptyHost);
        }

        let port: u16 = port
            .parse()
            .map_err(|_| TargetAddrError::BadPort(port.to_string()))?;
        if port == 0 {
            return Err(TargetAddrError::BadPort("0".to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for TargetAddr {
    type Err = TargetAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Errors parsing a `host:port` target
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetAddrError {
    #[error("missing ':' separator")]
    MissingSeparator,

    #[error("empty host")]
    EmptyHost,

    #[error("invalid port: {0}")]
    BadPort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port() {
        let addr = TargetAddr::parse("example.com:443").unwrap();
        assert_eq!(addr.host, "example.com");
        assert_eq!(addr.port, 443);
    }

    #[test]
    fn test_parse_ipv4() {
        let addr = TargetAddr::parse("127.0.0.1:80").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 80);
    }

    #[test]
    fn test_display_round_trip() {
        let addr = TargetAddr::new("example.com", 8080);
        let parsed = TargetAddr::parse(&addr.to_string()).unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn test_reject_missing_separator() {
        assert_eq!(
            TargetAddr::parse("example.com"),
            Err(TargetAddrError::MissingSeparator)
        );
    }

    #[test]
    fn test_reject_zero_port() {
        assert!(matches!(
            TargetAddr::parse("example.com:0"),
            Err(TargetAddrError::BadPort(_))
        ));
    }

    #[test]
    fn test_reject_bad_port() {
        assert!(matches!(
            TargetAddr::parse("example.com:http"),
            Err(TargetAddrError::BadPort(_))
        ));
        assert!(matches!(
            TargetAddr::parse("example.com:"),
            Err(TargetAddrError::BadPort(_))
        ));
    }

    #[test]
    fn test_reject_empty_host() {
        assert_eq!(TargetAddr::parse(":80"), Err(TargetAddrError::EmptyHost));
    }
}
