use serde::{Deserialize, Serialize};

/// A cluster node able to execute subtasks
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Stable node identity, independent of its address
    pub id: String,
    pub ip: String,
    pub port: u16,
}

impl InstanceInfo {
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            port,
        }
    }

    /// Address used as the subtask scheduler ID, IPv6 hosts bracketed
    pub fn exec_id(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }

    /// Parse an `host:port` exec ID back into an instance whose id is the address itself
    pub fn from_exec_id(exec_id: &str) -> Option<Self> {
        let (host, port) = exec_id.rsplit_once(':')?;
        let port = port.parse().ok()?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        Some(Self::new(exec_id, host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_id_formats() {
        let v4 = InstanceInfo::new("ddl_id_1", "10.123.124.10", 32457);
        assert_eq!(v4.exec_id(), "10.123.124.10:32457");

        let v6 = InstanceInfo::new("ddl_id_2", "ABCD:EF01:2345:6789:ABCD:EF01:2345:6789", 65535);
        assert_eq!(
            v6.exec_id(),
            "[ABCD:EF01:2345:6789:ABCD:EF01:2345:6789]:65535"
        );
    }

    #[test]
    fn test_from_exec_id() {
        let parsed = InstanceInfo::from_exec_id("[::1]:4000").unwrap();
        assert_eq!(parsed.ip, "::1");
        assert_eq!(parsed.port, 4000);
        assert_eq!(parsed.exec_id(), "[::1]:4000");

        let wildcard = InstanceInfo::from_exec_id(":4000").unwrap();
        assert_eq!(wildcard.ip, "");
        assert_eq!(wildcard.exec_id(), ":4000");

        assert!(InstanceInfo::from_exec_id("no-port").is_none());
    }
}
