// Connection-string parsing.
//
// Grammar: `address[:port][#group]`, where `address` is a hostname, an IPv4
// literal, or a bracketed IPv6 literal (`[::1]`). The group suffix is split
// off first at the *last* `#`; then the port is split off at the last `:`,
// but only if that colon comes after any closing bracket, so the colons
// inside an IPv6 literal are never mistaken for a port separator.
//
// Leniency rules:
// - A port that is not a valid `u16` leaves the default port in place.
// - A group suffix that is not a number is stripped but selects nothing.
// - Group `0` or anything above `MAX_GROUPS` selects spectating; `1..=15`
//   selects group `n - 1`.
//
// `normalize_connection_string` renders the canonical `address:port` form
// (brackets restored for IPv6) used as the key of the known-server list.

use std::fmt;

use lockstep_protocol::types::GroupSelector;

/// Split a connection string into `(address, port, group)`.
///
/// Brackets around an IPv6 literal are removed from the returned address.
pub fn parse_connection_string(
    input: &str,
    default_port: u16,
) -> (&str, u16, Option<GroupSelector>) {
    let (rest, group) = match input.rfind('#') {
        Some(hash) => (&input[..hash], parse_group(&input[hash + 1..])),
        None => (input, None),
    };

    let bracket = rest.rfind(']');
    let (address, port) = match rest.rfind(':') {
        Some(colon) if bracket.is_none_or(|b| colon > b) => {
            let port = rest[colon + 1..].parse::<u16>().unwrap_or(default_port);
            (&rest[..colon], port)
        }
        _ => (rest, default_port),
    };

    let address = address
        .strip_prefix('[')
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(address);

    (address, port, group)
}

fn parse_group(text: &str) -> Option<GroupSelector> {
    let value: u32 = text.parse().ok()?;
    Some(match u8::try_from(value) {
        Ok(value) => GroupSelector::from_user_value(value),
        Err(_) => GroupSelector::Spectator,
    })
}

/// Canonical `address:port` form of a connection string. The group suffix
/// is dropped. Applying this twice gives the same result as applying it once.
pub fn normalize_connection_string(input: &str, default_port: u16) -> String {
    let (address, port, _) = parse_connection_string(input, default_port);
    render(address, port)
}

fn render(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

/// Owned, parsed connection string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionEndpoint {
    pub address: String,
    pub port: u16,
    pub group: Option<GroupSelector>,
}

impl ConnectionEndpoint {
    pub fn parse(input: &str, default_port: u16) -> Self {
        let (address, port, group) = parse_connection_string(input, default_port);
        ConnectionEndpoint {
            address: address.to_string(),
            port,
            group,
        }
    }

    /// `address:port` suitable for `TcpStream::connect`.
    pub fn socket_string(&self) -> String {
        render(&self.address, self.port)
    }
}

impl fmt::Display for ConnectionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_and_group() {
        assert_eq!(
            parse_connection_string("example.net:4000#3", 3979),
            ("example.net", 4000, Some(GroupSelector::Group(2)))
        );
    }

    #[test]
    fn missing_parts_fall_back_to_defaults() {
        assert_eq!(
            parse_connection_string("example.net", 3979),
            ("example.net", 3979, None)
        );
        assert_eq!(
            parse_connection_string("10.0.0.7#1", 3979),
            ("10.0.0.7", 3979, Some(GroupSelector::Group(0)))
        );
    }

    #[test]
    fn bracketed_ipv6_strips_brackets() {
        assert_eq!(parse_connection_string("[::1]:1234", 3979), ("::1", 1234, None));
        assert_eq!(
            parse_connection_string("[fe80::1]", 3979),
            ("fe80::1", 3979, None)
        );
        assert_eq!(
            parse_connection_string("[2001:db8::5]:77#0", 3979),
            ("2001:db8::5", 77, Some(GroupSelector::Spectator))
        );
    }

    #[test]
    fn out_of_range_groups_spectate() {
        let (_, _, group) = parse_connection_string("h#16", 1);
        assert_eq!(group, Some(GroupSelector::Spectator));
        let (_, _, group) = parse_connection_string("h#70000", 1);
        assert_eq!(group, Some(GroupSelector::Spectator));
        let (_, _, group) = parse_connection_string("h#15", 1);
        assert_eq!(group, Some(GroupSelector::Group(14)));
    }

    #[test]
    fn non_numeric_group_is_stripped_without_selecting() {
        assert_eq!(
            parse_connection_string("h:99#red", 1),
            ("h", 99, None)
        );
    }

    #[test]
    fn last_hash_wins() {
        assert_eq!(
            parse_connection_string("we#ird:5#2", 1),
            ("we#ird", 5, Some(GroupSelector::Group(1)))
        );
    }

    #[test]
    fn bad_port_keeps_default() {
        assert_eq!(parse_connection_string("h:port", 3979), ("h", 3979, None));
        assert_eq!(parse_connection_string("h:99999", 3979), ("h", 3979, None));
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["example.net", "example.net:12#4", "[::1]:1234", "[::1]#2", "1.2.3.4:5"] {
            let once = normalize_connection_string(input, 3979);
            let twice = normalize_connection_string(&once, 3979);
            assert_eq!(once, twice, "input {input}");
        }
        assert_eq!(normalize_connection_string("[::1]#2", 3979), "[::1]:3979");
        assert_eq!(normalize_connection_string("example.net", 3979), "example.net:3979");
    }

    #[test]
    fn endpoint_displays_normalized() {
        let endpoint = ConnectionEndpoint::parse("[::1]:8000#5", 3979);
        assert_eq!(endpoint.address, "::1");
        assert_eq!(endpoint.group, Some(GroupSelector::Group(4)));
        assert_eq!(endpoint.to_string(), "[::1]:8000");
    }
}
