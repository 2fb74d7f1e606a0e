//! RFC 1459/2812 line parsing and encoding.

/// One parsed IRC line: `[:prefix] command param [param ...] [:trailing]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
    pub trailing: Option<String>,
}

impl Message {
    /// Parse a single line (no trailing `\r\n`). Lossy on invalid UTF-8
    /// bytes, matching the "tolerance for Latin-1" requirement: callers
    /// are expected to have already decoded the raw bytes with
    /// `String::from_utf8_lossy` before reaching this parser.
    pub fn parse(line: &str) -> Option<Message> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }
        let mut rest = line;

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (prefix, remainder) = stripped.split_once(' ')?;
            rest = remainder.trim_start();
            Some(prefix.to_string())
        } else {
            None
        };

        let (before_trailing, trailing) = match rest.split_once(" :") {
            Some((before, after)) => (before, Some(after.to_string())),
            None => (rest, None),
        };

        let mut tokens = before_trailing.split(' ').filter(|s| !s.is_empty());
        let command = tokens.next()?.to_string();
        let params: Vec<String> = tokens.map(|s| s.to_string()).collect();

        Some(Message {
            prefix,
            command,
            params,
            trailing,
        })
    }

    /// The nick portion of `prefix`, for prefixes of the form
    /// `nick!user@host`.
    pub fn prefix_nick(&self) -> Option<&str> {
        self.prefix.as_deref().and_then(|p| p.split('!').next())
    }

    /// Encode as a wire line, without the terminating `\r\n`.
    pub fn encode(command: &str, params: &[&str], trailing: Option<&str>) -> String {
        let mut line = command.to_string();
        for param in params {
            line.push(' ');
            line.push_str(param);
        }
        if let Some(trailing) = trailing {
            line.push_str(" :");
            line.push_str(trailing);
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_command() {
        let msg = Message::parse("PING :tungsten.libera.chat").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.trailing.as_deref(), Some("tungsten.libera.chat"));
    }

    #[test]
    fn parses_prefixed_numeric_with_params() {
        let msg = Message::parse(":server.example 001 mynick :Welcome to the network").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("server.example"));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["mynick"]);
        assert_eq!(msg.trailing.as_deref(), Some("Welcome to the network"));
    }

    #[test]
    fn parses_privmsg_with_prefix_nick() {
        let msg =
            Message::parse(":bot1!~bot@host.example PRIVMSG #chan :hello there").unwrap();
        assert_eq!(msg.prefix_nick(), Some("bot1"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan"]);
        assert_eq!(msg.trailing.as_deref(), Some("hello there"));
    }

    #[test]
    fn empty_line_is_none() {
        assert!(Message::parse("").is_none());
        assert!(Message::parse("\r\n").is_none());
    }

    #[test]
    fn encode_roundtrips_join() {
        let line = Message::encode("JOIN", &["#chan"], None);
        assert_eq!(line, "JOIN #chan");
    }

    #[test]
    fn encode_with_trailing() {
        let line = Message::encode("PRIVMSG", &["#chan"], Some("xdcc send 5"));
        assert_eq!(line, "PRIVMSG #chan :xdcc send 5");
    }
}
