//! Parsing of the tunnel binary's logfmt output.

use std::collections::HashMap;

/// Message the tunnel binary logs once a public endpoint is live.
const STARTED_TUNNEL_MSG: &str = "started tunnel";

/// Parse one logfmt line into key/value pairs.
///
/// Handles bare values (`level=info`), double-quoted values with `\"` and
/// `\\` escapes (`msg="started tunnel"`) and key-only flags (`verbose`,
/// which map to an empty value). Later duplicates win.
pub fn parse_line(line: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut chars = line.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'=') {
            chars.next();
            if chars.peek() == Some(&'"') {
                chars.next();
                while let Some(c) = chars.next() {
                    match c {
                        '"' => break,
                        '\\' => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => break,
                        },
                        c => value.push(c),
                    }
                }
            } else {
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() {
                        break;
                    }
                    value.push(c);
                    chars.next();
                }
            }
        }

        if !key.is_empty() {
            fields.insert(key, value);
        }
    }

    fields
}

/// The public URL from a "started tunnel" line, if this is one.
pub fn started_tunnel_url(line: &str) -> Option<String> {
    let fields = parse_line(line);
    if fields.get("msg").map(String::as_str) != Some(STARTED_TUNNEL_MSG) {
        return None;
    }
    fields.get("url").filter(|u| !u.is_empty()).cloned()
}

/// Finds the first public URL in a stream of log lines.
///
/// Yields at most once; every later line, including further "started
/// tunnel" lines, is ignored.
#[derive(Debug, Default)]
pub struct UrlDetector {
    found: Option<String>,
}

impl UrlDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line. Returns the URL the first time one is seen.
    pub fn feed(&mut self, line: &str) -> Option<String> {
        if self.found.is_some() {
            return None;
        }
        let url = started_tunnel_url(line)?;
        self.found = Some(url.clone());
        Some(url)
    }
}
