//! Formatting utilities for Telegram HTML messages.

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

const ELLIPSIS: &str = "...";

/// Shorten Telegram HTML to at most `max_chars` characters.
///
/// The cut never lands inside a tag or an entity, and tags it leaves open
/// are closed again, so the result still parses.
pub fn truncate_html(html: &str, max_chars: usize) -> String {
    if html.chars().count() <= max_chars {
        return html.to_string();
    }

    let mut budget = max_chars.saturating_sub(ELLIPSIS.len());
    loop {
        let cut = safe_prefix(html, budget);
        let closers: String = open_tags(cut)
            .iter()
            .rev()
            .map(|tag| format!("</{tag}>"))
            .collect();
        let total = cut.chars().count() + ELLIPSIS.len() + closers.len();
        if total <= max_chars || budget == 0 {
            return format!("{cut}{ELLIPSIS}{closers}");
        }
        budget = budget.saturating_sub(total - max_chars);
    }
}

/// First `budget` characters, backed off to before any unfinished tag or entity.
fn safe_prefix(html: &str, budget: usize) -> &str {
    let end = html
        .char_indices()
        .nth(budget)
        .map(|(i, _)| i)
        .unwrap_or(html.len());
    let mut cut = &html[..end];
    if let Some(lt) = cut.rfind('<') {
        if !cut[lt..].contains('>') {
            cut = &cut[..lt];
        }
    }
    if let Some(amp) = cut.rfind('&') {
        if !cut[amp..].contains(';') {
            cut = &cut[..amp];
        }
    }
    cut
}

/// Names of tags still open at the end of `html`, outermost first.
fn open_tags(html: &str) -> Vec<&str> {
    let mut stack: Vec<&str> = Vec::new();
    let mut rest = html;
    while let Some(lt) = rest.find('<') {
        let Some(len) = rest[lt..].find('>') else {
            break;
        };
        let tag = &rest[lt + 1..lt + len];
        rest = &rest[lt + len + 1..];

        if let Some(closing) = tag.strip_prefix('/') {
            let name = closing.trim();
            if let Some(pos) = stack.iter().rposition(|open| *open == name) {
                stack.truncate(pos);
            }
        } else if !tag.ends_with('/') {
            let name = tag.split_whitespace().next().unwrap_or("");
            if !name.is_empty() {
                stack.push(name);
            }
        }
    }
    stack
}

/// Notification for a regular (non-Jira) email.
pub fn new_mail_notification(from: &str, subject: &str) -> String {
    format!(
        "📩 New email from {}\n<b>Subject:</b> {}",
        escape_html(from),
        escape_html(subject)
    )
}

pub fn on_off(value: bool) -> &'static str {
    if value {
        "ON"
    } else {
        "OFF"
    }
}
