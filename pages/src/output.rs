use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

use console::style;
use pages_core::LogItem;

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn brand_accent<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).cyan()
}

pub fn brand_fg<D: Display>(value: D) -> console::StyledObject<D> {
    style(value)
}

pub fn brand_muted<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).dim()
}

pub fn brand_success<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).green()
}

pub fn brand_warning<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).yellow()
}

pub fn brand_error<D: Display>(value: D) -> console::StyledObject<D> {
    style(value).red()
}

pub fn set_verbose(verbose: bool) {
    VERBOSE.store(verbose, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn step(message: &str) {
    println!("{} {}", brand_accent("•").bold(), brand_fg(message));
}

pub fn success(message: &str) {
    println!("{} {}", brand_success("✓").bold(), brand_fg(message));
}

pub fn warning(message: &str) {
    println!("{} {}", brand_warning("!").bold(), brand_fg(message));
}

pub fn error_stderr(message: &str) {
    eprintln!("{} {}", brand_error("✗").bold(), brand_fg(message));
}

pub fn muted(message: &str) {
    println!("{}", brand_muted(message));
}

/// Split `tag: text` into its tag and the rest.
fn split_tag(text: &str) -> (Option<&str>, &str) {
    match text.split_once(": ") {
        Some((tag, rest))
            if !tag.is_empty() && tag.len() <= 8 && tag.chars().all(|c| c.is_ascii_lowercase()) =>
        {
            (Some(tag), rest)
        }
        _ => (None, text),
    }
}

/// One session log line with its tag coloured.
pub fn format_log_line(item: &LogItem) -> String {
    let (tag, rest) = split_tag(&item.text);
    let Some(tag) = tag else {
        return item.text.clone();
    };
    let label = format!("{tag}:");
    let label = match tag {
        "err" => brand_error(label).bold().to_string(),
        "pages" => brand_accent(label).bold().to_string(),
        "tunnel" => brand_success(label).to_string(),
        _ => brand_muted(label).to_string(),
    };
    if item.is_stderr() && tag != "err" {
        format!("{label} {}", brand_warning(rest))
    } else {
        format!("{label} {rest}")
    }
}

/// Print a session log line: stderr lines to stderr, the rest to stdout.
pub fn log_line(item: &LogItem) {
    if item.is_stderr() {
        eprintln!("{}", format_log_line(item));
    } else {
        println!("{}", format_log_line(item));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_tag_recognises_short_lowercase_tags() {
        assert_eq!(split_tag("dev: ready"), (Some("dev"), "ready"));
        assert_eq!(split_tag("err: boom: detail"), (Some("err"), "boom: detail"));
        assert_eq!(split_tag("Error: boom"), (None, "Error: boom"));
        assert_eq!(split_tag("plain line"), (None, "plain line"));
    }

    #[test]
    fn format_keeps_text_without_colors() {
        console::set_colors_enabled(false);
        assert_eq!(format_log_line(&LogItem::stdout("dev: ready")), "dev: ready");
        assert_eq!(
            format_log_line(&LogItem::stderr("err: spawn failed")),
            "err: spawn failed"
        );
        assert_eq!(format_log_line(&LogItem::stdout("untagged")), "untagged");
    }
}
