//! Listening endpoints and snapshot diffing

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A locally bound listening socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: impl Into<IpAddr>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.socket_addr().fmt(f)
    }
}

/// Every endpoint bound at one poll instant
pub type ListenSnapshot = BTreeSet<Endpoint>;

/// A change between two consecutive snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenEvent {
    Added(Endpoint),
    Removed(Endpoint),
}

impl ListenEvent {
    pub fn endpoint(&self) -> Endpoint {
        match self {
            ListenEvent::Added(endpoint) | ListenEvent::Removed(endpoint) => *endpoint,
        }
    }

    pub fn port(&self) -> u16 {
        self.endpoint().port
    }
}

impl fmt::Display for ListenEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenEvent::Added(endpoint) => write!(f, "added {}", endpoint),
            ListenEvent::Removed(endpoint) => write!(f, "removed {}", endpoint),
        }
    }
}

/// Result of comparing two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub added: Vec<Endpoint>,
    pub removed: Vec<Endpoint>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// All additions first, then all removals
    pub fn into_events(self) -> impl Iterator<Item = ListenEvent> {
        self.added
            .into_iter()
            .map(ListenEvent::Added)
            .chain(self.removed.into_iter().map(ListenEvent::Removed))
    }
}

/// Compute what changed from `previous` to `current`
pub fn diff(previous: &ListenSnapshot, current: &ListenSnapshot) -> SnapshotDiff {
    SnapshotDiff {
        added: current.difference(previous).copied().collect(),
        removed: previous.difference(current).copied().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(Ipv4Addr::UNSPECIFIED, port)
    }

    fn snapshot(endpoints: &[Endpoint]) -> ListenSnapshot {
        endpoints.iter().copied().collect()
    }

    fn as_set(endpoints: &[Endpoint]) -> HashSet<Endpoint> {
        endpoints.iter().copied().collect()
    }

    #[test]
    fn test_first_diff_reports_everything_added() {
        let current = snapshot(&[ep(22), ep(8080)]);
        let result = diff(&ListenSnapshot::new(), &current);

        assert_eq!(as_set(&result.added), as_set(&[ep(22), ep(8080)]));
        assert!(result.removed.is_empty());
    }

    #[test]
    fn test_diff_with_itself_is_empty() {
        let cases = [
            snapshot(&[]),
            snapshot(&[ep(80)]),
            snapshot(&[ep(80), ep(443), Endpoint::new(Ipv6Addr::LOCALHOST, 443)]),
        ];
        for s in &cases {
            assert!(diff(s, s).is_empty());
        }
    }

    #[test]
    fn test_diff_is_antisymmetric() {
        let a = snapshot(&[ep(1), ep(2), ep(3)]);
        let b = snapshot(&[ep(3), ep(4)]);

        let forward = diff(&a, &b);
        let backward = diff(&b, &a);

        assert_eq!(as_set(&forward.added), as_set(&backward.removed));
        assert_eq!(as_set(&forward.removed), as_set(&backward.added));
        assert_eq!(as_set(&forward.added), as_set(&[ep(4)]));
        assert_eq!(as_set(&forward.removed), as_set(&[ep(1), ep(2)]));
    }

    #[test]
    fn test_same_port_different_address_is_distinct() {
        let v4 = Endpoint::new(Ipv4Addr::UNSPECIFIED, 8080);
        let v6 = Endpoint::new(Ipv6Addr::UNSPECIFIED, 8080);
        let result = diff(&snapshot(&[v4]), &snapshot(&[v4, v6]));

        assert_eq!(result.added, vec![v6]);
        assert!(result.removed.is_empty());
    }

    #[test]
    fn test_events_put_additions_first() {
        let result = diff(&snapshot(&[ep(1), ep(2)]), &snapshot(&[ep(2), ep(3), ep(4)]));
        let events: Vec<ListenEvent> = result.into_events().collect();

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], ListenEvent::Added(_)));
        assert!(matches!(events[1], ListenEvent::Added(_)));
        assert_eq!(events[2], ListenEvent::Removed(ep(1)));
    }

    #[test]
    fn test_display() {
        let v6 = Endpoint::new(Ipv6Addr::LOCALHOST, 9000);
        assert_eq!(v6.to_string(), "[::1]:9000");
        assert_eq!(ListenEvent::Added(ep(80)).to_string(), "added 0.0.0.0:80");
        assert_eq!(ListenEvent::Removed(ep(80)).port(), 80);
    }
}
