use serde::{Deserialize, Serialize};
use std::fmt;

/// Which output stream of a supervised process produced a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Stdout,
    Stderr,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
        };
        f.pad(s)
    }
}

/// One line of output from a supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogItem {
    pub kind: LogKind,
    pub text: String,
}

impl LogItem {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            kind: LogKind::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            kind: LogKind::Stderr,
            text: text.into(),
        }
    }

    /// Prefix the text with a `tag:` marker, keeping the stream kind.
    ///
    /// Used by the session controller to tell compiler (`dev:`), function
    /// handler (`fn:`) and error (`err:`) lines apart in one merged stream.
    pub fn tagged(self, tag: &str) -> Self {
        Self {
            kind: self.kind,
            text: format!("{tag}: {}", self.text),
        }
    }

    pub fn is_stderr(&self) -> bool {
        self.kind == LogKind::Stderr
    }
}

impl fmt::Display for LogItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_prefixes_text_and_keeps_kind() {
        let item = LogItem::stderr("compile failed").tagged("dev");
        assert_eq!(item.kind, LogKind::Stderr);
        assert_eq!(item.text, "dev: compile failed");
    }

    #[test]
    fn log_kind_serializes_lowercase() {
        let json = serde_json::to_string(&LogItem::stdout("ready")).unwrap();
        assert_eq!(json, r#"{"kind":"stdout","text":"ready"}"#);
    }

    #[test]
    fn log_kind_display_pads() {
        assert_eq!(format!("{:<7}|", LogKind::Stdout), "stdout |");
    }
}
