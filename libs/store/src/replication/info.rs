use super::Address;
use super::error::ReplicationError;

use std::sync::LazyLock;

use regex::Regex;

const ROLE_PRIMARY_MARKER: &str = "role:master";
const ROLE_SECONDARY_MARKER: &str = "role:slave";

/// One pattern for every line shape we read out of the replication section of
/// an INFO report. The report is produced by a third-party tool and is stable
/// but not versioned: anything the pattern does not match is ignored, which
/// keeps the parser alive across additions and reorderings.
static REPORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?m)^(?:",
        r"connected_slaves:(?P<connected>\d+)",
        r"|master_repl_offset:(?P<primary_offset>\d+)",
        r"|slave\d+:ip=(?P<sec_host>(?:\d{1,3}\.){3}\d{1,3}),port=(?P<sec_port>\d{1,5}),state=\w+,offset=(?P<sec_offset>\d+),lag=\d+",
        r"|slave_priority:(?P<priority>\d+)",
        r"|slave_repl_offset:(?P<secondary_offset>\d+)",
        r"|master_host:(?P<primary_host>(?:\d{1,3}\.){3}\d{1,3})",
        r"|master_port:(?P<primary_port>\d{1,5})",
        r"|master_link_status:(?P<link>\w+)",
        r")\r?$",
    ))
    // safe unwrap: the pattern is a compile-time constant
    .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

/// A secondary as advertised by its primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedSecondary {
    pub address: Address,
    pub replication_offset: u64,
}

/// Parsed replication section of one instance's INFO report. Fields that only
/// make sense for the other role stay zero-valued.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationState {
    pub role: Role,
    pub replication_offset: u64,

    // primary-side fields
    pub connected_secondaries: u64,
    pub secondaries: Vec<AdvertisedSecondary>,

    // secondary-side fields
    pub secondary_priority: u64,
    pub primary_host: String,
    pub primary_port: String,
    pub primary_link_status: String,
}

impl ReplicationState {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            replication_offset: 0,
            connected_secondaries: 0,
            secondaries: Vec::new(),
            secondary_priority: 0,
            primary_host: String::new(),
            primary_port: String::new(),
            primary_link_status: String::new(),
        }
    }
}

/// Parse the text body of an INFO replication report.
///
/// The role markers decide everything: without one the report is unusable and
/// parsing fails. Every other line is optional; a line that fails to parse
/// numerically leaves its field zero-valued, which the election rules
/// tolerate.
pub fn parse_report(body: &str) -> Result<ReplicationState, ReplicationError> {
    let role = if body.contains(ROLE_PRIMARY_MARKER) {
        Role::Primary
    } else if body.contains(ROLE_SECONDARY_MARKER) {
        Role::Secondary
    } else {
        return Err(ReplicationError::Parse);
    };

    let mut state = ReplicationState::new(role);
    for caps in REPORT_LINE.captures_iter(body) {
        match role {
            Role::Primary => {
                if let Some(m) = caps.name("connected") {
                    state.connected_secondaries = parse_number(m.as_str());
                } else if let Some(m) = caps.name("primary_offset") {
                    state.replication_offset = parse_number(m.as_str());
                } else if let (Some(host), Some(port), Some(offset)) = (
                    caps.name("sec_host"),
                    caps.name("sec_port"),
                    caps.name("sec_offset"),
                ) {
                    state.secondaries.push(AdvertisedSecondary {
                        address: Address::new(host.as_str(), port.as_str()),
                        replication_offset: parse_number(offset.as_str()),
                    });
                }
            }
            Role::Secondary => {
                if let Some(m) = caps.name("priority") {
                    state.secondary_priority = parse_number(m.as_str());
                } else if let Some(m) = caps.name("secondary_offset") {
                    state.replication_offset = parse_number(m.as_str());
                } else if let Some(m) = caps.name("primary_host") {
                    state.primary_host = m.as_str().to_string();
                } else if let Some(m) = caps.name("primary_port") {
                    state.primary_port = m.as_str().to_string();
                } else if let Some(m) = caps.name("link") {
                    state.primary_link_status = m.as_str().to_string();
                }
            }
        }
    }
    Ok(state)
}

fn parse_number(digits: &str) -> u64 {
    digits.parse().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIMARY_REPORT: &str = "\
# Replication\r
role:master\r
connected_slaves:2\r
slave0:ip=10.0.0.11,port=6379,state=online,offset=47054,lag=0\r
slave1:ip=10.0.0.12,port=6379,state=online,offset=47040,lag=1\r
master_failover_state:no-failover\r
master_replid:8c4e8b42c86cbb1ee57e6f8bd57a383a934df11a\r
master_replid2:0000000000000000000000000000000000000000\r
master_repl_offset:47054\r
second_repl_offset:-1\r
repl_backlog_active:1\r
repl_backlog_size:1048576\r
";

    const SECONDARY_REPORT: &str = "\
# Replication\r
role:slave\r
master_host:10.0.0.10\r
master_port:6379\r
master_link_status:up\r
master_last_io_seconds_ago:3\r
master_sync_in_progress:0\r
slave_read_repl_offset:47054\r
slave_repl_offset:47054\r
slave_priority:100\r
slave_read_only:1\r
connected_slaves:0\r
master_repl_offset:0\r
";

    #[test]
    fn test_parse_primary_report() {
        let state = parse_report(PRIMARY_REPORT).unwrap();
        assert_eq!(state.role, Role::Primary);
        assert_eq!(state.connected_secondaries, 2);
        assert_eq!(state.replication_offset, 47054);
        assert_eq!(
            state.secondaries,
            vec![
                AdvertisedSecondary {
                    address: Address::new("10.0.0.11", "6379"),
                    replication_offset: 47054,
                },
                AdvertisedSecondary {
                    address: Address::new("10.0.0.12", "6379"),
                    replication_offset: 47040,
                },
            ]
        );
        // secondary-only fields stay zero-valued
        assert_eq!(state.secondary_priority, 0);
        assert!(state.primary_host.is_empty());
        assert!(state.primary_link_status.is_empty());
    }

    #[test]
    fn test_parse_secondary_report() {
        let state = parse_report(SECONDARY_REPORT).unwrap();
        assert_eq!(state.role, Role::Secondary);
        assert_eq!(state.replication_offset, 47054);
        assert_eq!(state.secondary_priority, 100);
        assert_eq!(state.primary_host, "10.0.0.10");
        assert_eq!(state.primary_port, "6379");
        assert_eq!(state.primary_link_status, "up");
        // primary-only fields stay zero-valued even though the report
        // carries connected_slaves/master_repl_offset lines
        assert_eq!(state.connected_secondaries, 0);
        assert!(state.secondaries.is_empty());
    }

    #[test]
    fn test_parse_without_role_marker_fails() {
        assert!(matches!(parse_report(""), Err(ReplicationError::Parse)));
        assert!(matches!(
            parse_report("# Replication\nconnected_slaves:2\n"),
            Err(ReplicationError::Parse)
        ));
    }

    #[test]
    fn test_parse_minimal_report_leaves_fields_zero_valued() {
        let state = parse_report("role:master\n").unwrap();
        assert_eq!(state.role, Role::Primary);
        assert_eq!(state.connected_secondaries, 0);
        assert_eq!(state.replication_offset, 0);
        assert!(state.secondaries.is_empty());

        let state = parse_report("role:slave\n").unwrap();
        assert_eq!(state.role, Role::Secondary);
        assert_eq!(state.secondary_priority, 0);
        assert!(state.primary_host.is_empty());
    }

    #[test]
    fn test_parse_tolerates_unix_line_endings() {
        let body = "role:master\nconnected_slaves:1\nslave0:ip=10.0.0.11,port=6379,state=online,offset=12,lag=0\n";
        let state = parse_report(body).unwrap();
        assert_eq!(state.connected_secondaries, 1);
        assert_eq!(state.secondaries.len(), 1);
    }

    #[test]
    fn test_parse_ignores_malformed_secondary_lines() {
        let body = "role:master\nconnected_slaves:1\nslave0:ip=not-an-ip,port=6379,state=online,offset=12,lag=0\n";
        let state = parse_report(body).unwrap();
        assert!(state.secondaries.is_empty());
    }

    #[test]
    fn test_numeric_overflow_degrades_to_zero() {
        let body = "role:slave\nslave_priority:99999999999999999999999999\n";
        let state = parse_report(body).unwrap();
        assert_eq!(state.secondary_priority, 0);
    }
}
