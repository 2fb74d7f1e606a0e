//! CTCP framing and DCC SEND/SSEND/ACCEPT grammar.

use std::net::Ipv4Addr;

/// `DCC SEND`/`SSEND` offer, after CTCP unwrapping and grammar parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DccOffer {
    pub secure: bool,
    pub filename: String,
    pub addr: DccAddr,
    pub port: u16,
    pub size: u64,
    pub token: Option<String>,
}

/// `DCC ACCEPT` reply to a `DCC RESUME` we sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DccAccept {
    pub filename: String,
    pub port: u16,
    pub position: u64,
    pub token: Option<String>,
}

/// Sender-advertised IP, which legacy DCC encodes as a 32-bit host-order
/// integer rather than a dotted quad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DccAddr {
    Dotted(Ipv4Addr),
    /// `port == 0` on the offer; this peer is awaiting an inbound
    /// connection (passive/reverse DCC) and has no address to give yet.
    Passive,
}

impl DccAddr {
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            DccAddr::Dotted(ip) => Some(*ip),
            DccAddr::Passive => None,
        }
    }

    fn parse(token: &str) -> Option<DccAddr> {
        if let Ok(ip) = token.parse::<Ipv4Addr>() {
            return Some(DccAddr::Dotted(ip));
        }
        let as_u32: u32 = token.parse().ok()?;
        Some(DccAddr::Dotted(Ipv4Addr::from(as_u32)))
    }
}

const CTCP_MARKER: char = '\u{1}';

/// Strip the leading/trailing `\x01` CTCP delimiters from a PRIVMSG
/// trailing parameter, low-level-dequoting the payload per the CTCP spec.
pub fn unwrap_ctcp(trailing: &str) -> Option<String> {
    let inner = trailing
        .strip_prefix(CTCP_MARKER)?
        .strip_suffix(CTCP_MARKER)
        .unwrap_or_else(|| trailing.strip_prefix(CTCP_MARKER).unwrap());
    Some(low_level_dequote(inner))
}

/// CTCP low-level quoting: escape `\x01`, `\\`, `\r`, `\n`, `\0` so they
/// survive transport as one PRIVMSG trailing argument.
pub fn low_level_quote(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\u{10}' => out.push_str("\u{10}\u{10}"),
            '\u{1}' => out.push_str("\u{10}a"),
            '\0' => out.push_str("\u{10}0"),
            '\r' => out.push_str("\u{10}r"),
            '\n' => out.push_str("\u{10}n"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`low_level_quote`].
pub fn low_level_dequote(quoted: &str) -> String {
    let mut out = String::with_capacity(quoted.len());
    let mut chars = quoted.chars();
    while let Some(ch) = chars.next() {
        if ch == '\u{10}' {
            match chars.next() {
                Some('\u{10}') => out.push('\u{10}'),
                Some('a') => out.push('\u{1}'),
                Some('0') => out.push('\0'),
                Some('r') => out.push('\r'),
                Some('n') => out.push('\n'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn split_filename(rest: &str) -> Option<(String, &str)> {
    if let Some(stripped) = rest.strip_prefix('"') {
        let end_quote = stripped.find('"')?;
        let name = stripped[..end_quote].to_string();
        Some((name, stripped[end_quote + 1..].trim_start()))
    } else {
        let (name, remainder) = rest.split_once(' ')?;
        Some((name.to_string(), remainder.trim_start()))
    }
}

/// Validate an advertised filename, rejecting traversal attempts and any
/// path separator outright (spec §4.2: "Reject if ... the filename
/// contains path separators or is empty").
pub fn sanitize_filename(raw: &str) -> Option<String> {
    if raw.is_empty() || raw.contains("..") || raw.contains('/') || raw.contains('\\') {
        return None;
    }
    Some(raw.to_string())
}

/// Parse a CTCP-unwrapped `DCC SEND`/`SSEND ...` payload.
pub fn parse_dcc_send(payload: &str) -> Option<DccOffer> {
    let payload = payload.trim();
    let (secure, rest) = if let Some(r) = payload.strip_prefix("DCC SSEND ") {
        (true, r)
    } else if let Some(r) = payload.strip_prefix("DCC SEND ") {
        (false, r)
    } else {
        return None;
    };

    let (filename_raw, rest) = split_filename(rest.trim_start())?;
    let filename = sanitize_filename(&filename_raw)?;

    let mut tokens = rest.split_whitespace();
    let ip_token = tokens.next()?;
    let port: u16 = tokens.next()?.parse().ok()?;
    let size: u64 = tokens.next()?.parse().ok()?;
    let token = tokens.next().map(|s| s.to_string());

    let addr = if port == 0 {
        DccAddr::Passive
    } else {
        DccAddr::parse(ip_token)?
    };

    Some(DccOffer {
        secure,
        filename,
        addr,
        port,
        size,
        token,
    })
}

/// Parse a CTCP-unwrapped `DCC ACCEPT ...` payload.
pub fn parse_dcc_accept(payload: &str) -> Option<DccAccept> {
    let rest = payload.trim().strip_prefix("DCC ACCEPT ")?;
    let (filename_raw, rest) = split_filename(rest.trim_start())?;
    let filename = sanitize_filename(&filename_raw)?;

    let mut tokens = rest.split_whitespace();
    let port: u16 = tokens.next()?.parse().ok()?;
    let position: u64 = tokens.next()?.parse().ok()?;
    let token = tokens.next().map(|s| s.to_string());

    Some(DccAccept {
        filename,
        port,
        position,
        token,
    })
}

/// Encode a `DCC RESUME` request, CTCP-wrapped, ready to send as a PRIVMSG
/// trailing argument.
pub fn encode_resume(filename: &str, port: u16, position: u64, token: Option<&str>) -> String {
    let mut body = format!("DCC RESUME \"{filename}\" {port} {position}");
    if let Some(token) = token {
        body.push(' ');
        body.push_str(token);
    }
    format!("{CTCP_MARKER}{body}{CTCP_MARKER}")
}

/// Encode a passive-DCC `DCC SEND` reply advertising our listener.
pub fn encode_passive_send(
    filename: &str,
    our_ip: Ipv4Addr,
    our_port: u16,
    size: u64,
    token: &str,
) -> String {
    format!(
        "{CTCP_MARKER}DCC SEND \"{filename}\" {our_ip_int} {our_port} {size} {token}{CTCP_MARKER}",
        our_ip_int = u32::from(our_ip),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwraps_ctcp_markers() {
        let payload = "\u{1}DCC SEND \"ep1.mkv\" 2130706433 5000 1048576\u{1}";
        let inner = unwrap_ctcp(payload).unwrap();
        assert_eq!(inner, "DCC SEND \"ep1.mkv\" 2130706433 5000 1048576");
    }

    #[test]
    fn parses_quoted_filename_with_legacy_ip() {
        let offer = parse_dcc_send("DCC SEND \"ep1.mkv\" 2130706433 5000 1048576").unwrap();
        assert_eq!(offer.filename, "ep1.mkv");
        assert_eq!(offer.addr.ipv4(), Some(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(offer.port, 5000);
        assert_eq!(offer.size, 1_048_576);
        assert!(!offer.secure);
    }

    #[test]
    fn parses_unquoted_filename_with_dotted_ip() {
        let offer = parse_dcc_send("DCC SEND file.bin 192.168.1.5 6000 500 tok1").unwrap();
        assert_eq!(offer.filename, "file.bin");
        assert_eq!(offer.addr.ipv4(), Some(Ipv4Addr::new(192, 168, 1, 5)));
        assert_eq!(offer.token.as_deref(), Some("tok1"));
    }

    #[test]
    fn ssend_is_flagged_secure() {
        let offer = parse_dcc_send("DCC SSEND \"f\" 16909060 443 1").unwrap();
        assert!(offer.secure);
    }

    #[test]
    fn port_zero_is_passive() {
        let offer = parse_dcc_send("DCC SEND \"x\" 0 0 100 tok42").unwrap();
        assert_eq!(offer.addr, DccAddr::Passive);
        assert_eq!(offer.token.as_deref(), Some("tok42"));
    }

    #[test]
    fn rejects_path_traversal_filenames() {
        assert!(sanitize_filename("../../etc/passwd").is_none());
        assert!(sanitize_filename("").is_none());
        assert!(sanitize_filename("subdir/safe.txt").is_none());
        assert!(sanitize_filename("subdir\\safe.txt").is_none());
    }

    #[test]
    fn parses_accept() {
        let accept = parse_dcc_accept("DCC ACCEPT \"ep1.mkv\" 5000 500000").unwrap();
        assert_eq!(accept.filename, "ep1.mkv");
        assert_eq!(accept.port, 5000);
        assert_eq!(accept.position, 500_000);
    }

    #[test]
    fn low_level_quote_roundtrips() {
        let raw = "has\x01ctcp\r\nand\0null";
        let quoted = low_level_quote(raw);
        assert_eq!(low_level_dequote(&quoted), raw);
    }

    #[test]
    fn encode_resume_contains_offset() {
        let line = encode_resume("ep1.mkv", 5000, 500_000, Some("tok1"));
        assert_eq!(line, "\u{1}DCC RESUME \"ep1.mkv\" 5000 500000 tok1\u{1}");
    }
}
