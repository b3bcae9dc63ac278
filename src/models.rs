pub mod domain {
    use serde::Serialize;
    use std::fmt;
    use std::net::IpAddr;
    use std::time::Instant;

    /// Placeholder for an address the capture layer could not extract.
    pub const UNKNOWN_ADDRESS: &str = "Unknown";

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub enum Address {
        Ip(IpAddr),
        Unknown,
    }

    impl From<Option<IpAddr>> for Address {
        fn from(ip: Option<IpAddr>) -> Self {
            ip.map_or(Address::Unknown, Address::Ip)
        }
    }

    impl fmt::Display for Address {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Address::Ip(ip) => write!(f, "{}", ip),
                Address::Unknown => f.write_str(UNKNOWN_ADDRESS),
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub enum Transport {
        Tcp,
        Udp,
        Icmp,
        Icmpv6,
    }

    impl Transport {
        pub fn as_str(self) -> &'static str {
            match self {
                Transport::Tcp => "TCP",
                Transport::Udp => "UDP",
                Transport::Icmp => "ICMP",
                Transport::Icmpv6 => "ICMPv6",
            }
        }
    }

    impl fmt::Display for Transport {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// One captured frame, resolved to the fields aggregation needs.
    ///
    /// `source`/`destination` are `None` when the frame carried no IP layer,
    /// `transport` is `None` when no recognised transport header followed it.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Observation {
        pub timestamp: Instant,
        pub source: Option<IpAddr>,
        pub destination: Option<IpAddr>,
        pub transport: Option<Transport>,
        pub length: u64,
    }

    impl Observation {
        pub fn new(
            timestamp: Instant,
            source: Option<IpAddr>,
            destination: Option<IpAddr>,
            transport: Option<Transport>,
            length: u64,
        ) -> Self {
            Observation {
                timestamp,
                source,
                destination,
                transport,
                length,
            }
        }

        pub fn has_addresses(&self) -> bool {
            self.source.is_some() && self.destination.is_some()
        }
    }

    /// Aggregation discipline. Each mode keeps its own sentinel text and
    /// kilobit convention.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Mode {
        Tumbling,
        Sliding,
    }

    impl Mode {
        /// Protocol text used when a frame had no transport layer.
        pub fn protocol_sentinel(self) -> &'static str {
            match self {
                Mode::Tumbling => "None",
                Mode::Sliding => "N/A",
            }
        }

        /// Tumbling reports kibibits, sliding reports decimal kilobits.
        pub fn kilobit_divisor(self) -> f64 {
            match self {
                Mode::Tumbling => 1024.0,
                Mode::Sliding => 1000.0,
            }
        }

        pub fn kbps(self, bytes: u64) -> f64 {
            (bytes as f64 * 8.0) / self.kilobit_divisor()
        }
    }

    impl fmt::Display for Mode {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Mode::Tumbling => f.write_str("tumbling"),
                Mode::Sliding => f.write_str("sliding"),
            }
        }
    }

    /// Aggregation bucket identity.
    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct FlowKey {
        pub source: Address,
        pub destination: Address,
        pub protocol: String,
    }

    impl fmt::Display for FlowKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{} → {} ({})", self.source, self.destination, self.protocol)
        }
    }
}

pub mod dto {
    use super::domain::Mode;
    use serde::Serialize;

    #[derive(Debug, Serialize, Clone, PartialEq)]
    pub struct FlowRateDTO {
        pub source: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub source_label: Option<String>,
        pub destination: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub destination_label: Option<String>,
        pub protocol: String,
        pub bytes: u64,
        pub kbps: f64,
    }

    #[derive(Debug, Serialize, Clone, PartialEq)]
    pub struct SnapshotDTO {
        pub timestamp: String,
        pub mode: Mode,
        pub window_secs: f64,
        pub flows: Vec<FlowRateDTO>,
        pub skipped: u64,
        pub truncated: u64,
    }
}
