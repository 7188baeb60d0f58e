//! Handler text protocol parser and response generator.
//!
//! Commands arrive as
//!
//! ```text
//! ["$"] "<<" [site | "*"] "%" CommandName "%" [body] [">>" | "%*>>"]
//! ```
//!
//! and every response is a single envelope
//!
//! ```text
//! "<<" site "%" NAME "%" field=value[;field=value...] ">>"
//! ```
//!
//! followed by a newline on the wire.

use std::collections::HashMap;
use std::fmt::Write;
use std::net::IpAddr;
use thiserror::Error;

/// Optional character some hosts put in front of each command
pub const SENTINEL: char = '$';

const OPEN: &str = "<<";
const CLOSE: &str = ">>";
const WILDCARD_CLOSE: &str = "%*>>";
const SEPARATOR: char = '%';

/// Site part of a command envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteToken {
    Absent,
    Wildcard,
    Number(u32),
}

impl SiteToken {
    /// Explicit site number, or the caller's site for wildcard/absent
    pub fn resolve(self, peer: IpAddr) -> u32 {
        match self {
            SiteToken::Number(site) => site,
            SiteToken::Absent | SiteToken::Wildcard => site_from_ip(peer),
        }
    }
}

/// A decoded command envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub site: SiteToken,
    pub command: &'a str,
    pub body: &'a str,
}

/// Envelope decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing '<<' opener")]
    MissingOpen,
    #[error("missing '%' separator")]
    MissingSeparator,
    #[error("invalid site token: {0}")]
    InvalidSite(String),
}

/// Decode one trimmed command
pub fn parse(input: &str) -> Result<Frame<'_>, ParseError> {
    let input = input.trim();
    let input = input.strip_prefix(SENTINEL).unwrap_or(input).trim_start();
    let inner = input.strip_prefix(OPEN).ok_or(ParseError::MissingOpen)?;
    let inner = inner
        .strip_suffix(WILDCARD_CLOSE)
        .or_else(|| inner.strip_suffix(CLOSE))
        .unwrap_or(inner);

    let (site, rest) = inner
        .split_once(SEPARATOR)
        .ok_or(ParseError::MissingSeparator)?;
    let (command, body) = rest.split_once(SEPARATOR).unwrap_or((rest, ""));

    Ok(Frame {
        site: parse_site(site.trim())?,
        command: command.trim(),
        body: body.trim(),
    })
}

fn parse_site(token: &str) -> Result<SiteToken, ParseError> {
    match token {
        "" => Ok(SiteToken::Absent),
        "*" => Ok(SiteToken::Wildcard),
        _ => token
            .parse()
            .map(SiteToken::Number)
            .map_err(|_| ParseError::InvalidSite(token.to_string())),
    }
}

/// Split a `KEY=VALUE;KEY=VALUE` body. Keys are upper-cased.
pub fn parse_params(body: &str) -> HashMap<String, String> {
    body.split(';')
        .filter_map(|pair| pair.split_once('='))
        .map(|(key, value)| (key.trim().to_ascii_uppercase(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Site number of a peer: the last dot-separated component of its address,
/// or 0 when that is not a number.
pub fn site_from_ip(peer: IpAddr) -> u32 {
    let addr = peer.to_string();
    addr.rsplit('.')
        .next()
        .and_then(|last| last.parse().ok())
        .unwrap_or(0)
}

/// Split the text of one read into commands.
///
/// Every `>>`-terminated command is returned in order. Trailing text with no
/// terminator is returned as one more command: a read is assumed to hold a
/// whole command, so a command split across reads is not reassembled.
pub fn split_commands(text: &str) -> Vec<&str> {
    let mut commands = Vec::new();
    let mut rest = text;

    while let Some(pos) = rest.find(CLOSE) {
        let (command, tail) = rest.split_at(pos + CLOSE.len());
        let command = command.trim();
        if !command.is_empty() {
            commands.push(command);
        }
        rest = tail;
    }

    let rest = rest.trim();
    if !rest.is_empty() {
        commands.push(rest);
    }
    commands
}

/// Response generator
pub struct Response;

impl Response {
    /// Build an envelope. `site` is left empty when `None`.
    pub fn envelope(site: Option<u32>, name: &str, fields: &[(&str, &str)]) -> String {
        let mut out = String::with_capacity(32);
        out.push_str(OPEN);
        if let Some(site) = site {
            let _ = write!(out, "{site}");
        }
        out.push(SEPARATOR);
        out.push_str(name);
        out.push(SEPARATOR);
        for (i, (key, value)) in fields.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            let _ = write!(out, "{key}={value}");
        }
        out.push_str(CLOSE);
        out
    }

    pub fn error(reason: &str) -> String {
        Self::envelope(None, "ERROR", &[("REASON", reason)])
    }

    pub fn ack(site: u32, command: &str) -> String {
        Self::envelope(Some(site), "ACK", &[("CMD", command)])
    }

    pub fn nak(site: u32, command: &str, reason: &str) -> String {
        Self::envelope(Some(site), "NAK", &[("CMD", command), ("REASON", reason)])
    }

    pub fn timeout(site: u32, command: &str, reason: &str) -> String {
        Self::envelope(Some(site), "TIMEOUT", &[("CMD", command), ("REASON", reason)])
    }

    pub fn unknown(command: &str) -> String {
        Self::envelope(None, "UNKNOWN", &[("CMD", command)])
    }
}

/// Format a temperature the way the handler reports it
pub fn format_temp(temp: f64) -> String {
    format!("{temp:.1}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_envelope() {
        let frame = parse("<<3%GetStatus%>>").unwrap();
        assert_eq!(frame.site, SiteToken::Number(3));
        assert_eq!(frame.command, "GetStatus");
        assert_eq!(frame.body, "");
    }

    #[test]
    fn test_parse_sentinel_and_wildcard_close() {
        let frame = parse("$<<*%SetSiteTemp%85.5%*>>").unwrap();
        assert_eq!(frame.site, SiteToken::Wildcard);
        assert_eq!(frame.command, "SetSiteTemp");
        assert_eq!(frame.body, "85.5");
    }

    #[test]
    fn test_parse_absent_site_and_no_close() {
        let frame = parse("<<%SetTestResult%BIN=1;BCD=X").unwrap();
        assert_eq!(frame.site, SiteToken::Absent);
        assert_eq!(frame.command, "SetTestResult");
        assert_eq!(frame.body, "BIN=1;BCD=X");
    }

    #[test]
    fn test_parse_command_without_body_separator() {
        let frame = parse("<<1%GetID>>").unwrap();
        assert_eq!(frame.command, "GetID");
        assert_eq!(frame.body, "");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse("GetStatus"), Err(ParseError::MissingOpen));
        assert_eq!(parse("<<GetStatus>>"), Err(ParseError::MissingSeparator));
        assert_eq!(
            parse("<<abc%GetStatus%>>"),
            Err(ParseError::InvalidSite("abc".to_string()))
        );
    }

    #[test]
    fn test_parse_params() {
        let params = parse_params("BIN=1; bcd = XYZ ;junk;=3");
        assert_eq!(params.get("BIN").map(String::as_str), Some("1"));
        assert_eq!(params.get("BCD").map(String::as_str), Some("XYZ"));
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn test_site_from_ip() {
        assert_eq!(site_from_ip("192.168.0.17".parse().unwrap()), 17);
        assert_eq!(site_from_ip("::1".parse().unwrap()), 0);
        assert_eq!(site_from_ip("::ffff:10.0.0.9".parse().unwrap()), 9);
    }

    #[test]
    fn test_site_token_resolve() {
        let peer: IpAddr = "10.1.1.4".parse().unwrap();
        assert_eq!(SiteToken::Number(2).resolve(peer), 2);
        assert_eq!(SiteToken::Wildcard.resolve(peer), 4);
        assert_eq!(SiteToken::Absent.resolve(peer), 4);
    }

    #[test]
    fn test_split_commands() {
        assert_eq!(split_commands("<<1%GetID%>>\r\n"), vec!["<<1%GetID%>>"]);
        assert_eq!(
            split_commands("<<1%GetID%>><<1%GetStatus%>>"),
            vec!["<<1%GetID%>>", "<<1%GetStatus%>>"]
        );
        assert_eq!(
            split_commands("<<1%GetID%>>\n<<1%GetSiteNo%"),
            vec!["<<1%GetID%>>", "<<1%GetSiteNo%"]
        );
        assert!(split_commands(" \r\n").is_empty());
    }

    #[test]
    fn test_envelope() {
        assert_eq!(
            Response::envelope(Some(2), "STATUS", &[("A", "1"), ("B", "")]),
            "<<2%STATUS%A=1;B=>>"
        );
        assert_eq!(Response::error("X"), "<<%ERROR%REASON=X>>");
        assert_eq!(Response::ack(1, "SetSiteTemp"), "<<1%ACK%CMD=SetSiteTemp>>");
        assert_eq!(format_temp(75.0), "75.0");
    }
}
