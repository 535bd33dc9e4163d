//! Jira notification email parser.
//!
//! Jira sends one HTML email per batch of issue changes. The parser recognizes
//! those emails, extracts who did what (created, assigned, commented, ...) and
//! condenses everything into a single Telegram HTML message grouped by author.

use std::collections::{BTreeMap, BTreeSet};

use regex::{Regex, RegexBuilder};
use scraper::{ElementRef, Html, Node};

use crate::{errors::Error, formatting::escape_html, Result};

const UNKNOWN_REPORTER: &str = "Unknown reporter";
const SOMEONE: &str = "Someone";

/// Kinds of Jira activity a user can subscribe to.
///
/// The declaration order is the order events are rendered in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JiraEvent {
    Assigned,
    Created,
    Update,
    Comment,
    MentionDescription,
    MentionComment,
    Worklog,
}

pub type EventSet = BTreeSet<JiraEvent>;

impl JiraEvent {
    /// Render order of a summary.
    pub const RENDER_ORDER: [JiraEvent; 7] = [
        JiraEvent::Assigned,
        JiraEvent::Created,
        JiraEvent::Update,
        JiraEvent::Comment,
        JiraEvent::MentionDescription,
        JiraEvent::MentionComment,
        JiraEvent::Worklog,
    ];

    /// Order of the toggles in the settings menu (and of the stored keys).
    pub const MENU_ORDER: [JiraEvent; 7] = [
        JiraEvent::Created,
        JiraEvent::Assigned,
        JiraEvent::Update,
        JiraEvent::Comment,
        JiraEvent::MentionDescription,
        JiraEvent::MentionComment,
        JiraEvent::Worklog,
    ];

    /// Key used in the user store and in callback data.
    pub fn key(self) -> &'static str {
        match self {
            JiraEvent::Assigned => "assigned",
            JiraEvent::Created => "created",
            JiraEvent::Update => "update",
            JiraEvent::Comment => "comment",
            JiraEvent::MentionDescription => "mention_description",
            JiraEvent::MentionComment => "mention_comment",
            JiraEvent::Worklog => "worklog",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::MENU_ORDER.into_iter().find(|e| e.key() == key)
    }

    fn summary_line(self) -> &'static str {
        match self {
            JiraEvent::Assigned => "✅ assigned the issue to you",
            JiraEvent::Created => "📌 created the issue",
            JiraEvent::Update => "✏️ updated the issue",
            JiraEvent::Comment => "💬 left a comment",
            JiraEvent::MentionDescription => "👀 mentioned you in the issue",
            JiraEvent::MentionComment => "👀 mentioned you in comments",
            JiraEvent::Worklog => "⏱️ logged time",
        }
    }
}

/// Compiled patterns for one Jira host.
#[derive(Clone, Debug)]
pub struct JiraParser {
    host: String,
    issue_link: Regex,
    created: Regex,
    assigned: Regex,
    mention_description: Regex,
    mention_comment: Regex,
    row_class: Regex,
    label_class: Regex,
    content_class: Regex,
    changes_by: Regex,
    worklog: Regex,
    comment_heading: Regex,
    update_heading: Regex,
}

fn ci(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| Error::Config(format!("invalid jira pattern {pattern:?}: {e}")))
}

impl JiraParser {
    pub fn new(host: &str) -> Result<Self> {
        let host = host.trim().to_lowercase();
        if host.is_empty() {
            return Err(Error::Config("jira host must not be empty".to_string()));
        }
        let issue_link = Regex::new(&format!(
            r"https://{}/browse/[A-Z0-9]+-\d+",
            regex::escape(&host)
        ))
        .map_err(|e| Error::Config(format!("invalid jira host {host:?}: {e}")))?;

        Ok(Self {
            issue_link,
            created: ci(r"issue created|has been created")?,
            assigned: ci(r"assigned to you")?,
            mention_description: ci(r"mentioned in the issue description")?,
            mention_comment: ci(r"mentioned in a comment")?,
            row_class: ci(r"field-update|row")?,
            label_class: ci(r"updates-diff-label|^label")?,
            content_class: ci(r"updates-diff-content|^content")?,
            changes_by: ci(r"changes by")?,
            worklog: ci(r"has added worklog")?,
            comment_heading: ci(r"comment")?,
            update_heading: ci(r"update")?,
            host,
        })
    }

    /// Parse an email body.
    ///
    /// - `None`: not a Jira email.
    /// - `Some(vec![])`: a Jira email with nothing left after filtering.
    /// - `Some(vec![msg])`: one condensed HTML message.
    ///
    /// `allowed = None` keeps every event type.
    pub fn parse(
        &self,
        subject: &str,
        raw_html: &str,
        allowed: Option<&EventSet>,
    ) -> Option<Vec<String>> {
        let lower_html = raw_html.to_lowercase();
        if !lower_html.contains(&self.host) && !lower_html.contains("atlassian jira") {
            return None;
        }

        let doc = Html::parse_document(raw_html);
        let root = doc.root_element();
        let body_text = visible_text(root);

        let header = self.issue_header(root, subject);
        let mut events = self.collect_events(root, &body_text);

        if let Some(allowed) = allowed {
            events.retain(|event, _| allowed.contains(event));
        }
        events.retain(|_, authors| !authors.is_empty());
        if events.is_empty() {
            return Some(Vec::new());
        }

        Some(vec![render_summary(&header, &events)])
    }

    fn issue_header(&self, root: ElementRef<'_>, subject: &str) -> String {
        let link = elements(root, "a").find(|a| {
            a.value()
                .attr("href")
                .map(|href| self.issue_link.is_match(href))
                .unwrap_or(false)
        });
        let summary = elements(root, "h1")
            .next()
            .map(|h| joined_text(h, ""))
            .unwrap_or_default();

        let Some(link) = link else {
            return escape_html(subject);
        };
        let url = link.value().attr("href").unwrap_or_default();
        let key = joined_text(link, "");
        if key.is_empty() {
            return escape_html(subject);
        }

        if summary.is_empty() {
            format!("<a href=\"{}\">[{}]</a>", escape_html(url), escape_html(&key))
        } else {
            format!(
                "<a href=\"{}\">[{}] {}</a>",
                escape_html(url),
                escape_html(&key),
                escape_html(&summary)
            )
        }
    }

    fn collect_events(
        &self,
        root: ElementRef<'_>,
        body_text: &str,
    ) -> BTreeMap<JiraEvent, BTreeSet<String>> {
        let mut events: BTreeMap<JiraEvent, BTreeSet<String>> = BTreeMap::new();

        if self.created.is_match(body_text) {
            let reporter = self
                .reporter_from_fields(root)
                .or_else(|| strong_with_parent_text(root, "created this issue on"))
                .unwrap_or_else(|| UNKNOWN_REPORTER.to_string());
            events.entry(JiraEvent::Created).or_default().insert(reporter);
        }

        if self.assigned.is_match(body_text) {
            let author = self
                .assignee_change_author(root)
                .or_else(|| {
                    events
                        .get(&JiraEvent::Created)
                        .and_then(|s| s.iter().next().cloned())
                })
                .unwrap_or_else(|| SOMEONE.to_string());
            events.entry(JiraEvent::Assigned).or_default().insert(author);
        }

        let comment_authors = self.comment_authors(root);

        if self.mention_description.is_match(body_text) {
            let mut authors = self.description_editors(root);
            if authors.is_empty() {
                authors.insert(SOMEONE.to_string());
            }
            events
                .entry(JiraEvent::MentionDescription)
                .or_default()
                .extend(authors);
        }

        if self.mention_comment.is_match(body_text) {
            let entry = events.entry(JiraEvent::MentionComment).or_default();
            if comment_authors.is_empty() {
                entry.insert(SOMEONE.to_string());
            } else {
                entry.extend(comment_authors.iter().cloned());
            }
        }

        let update_authors = self.update_authors(root);
        if !update_authors.is_empty() {
            events
                .entry(JiraEvent::Update)
                .or_default()
                .extend(update_authors);
        }

        if !comment_authors.is_empty() {
            events
                .entry(JiraEvent::Comment)
                .or_default()
                .extend(comment_authors);
        }

        let worklog_authors: BTreeSet<String> = text_node_parents(root, &self.worklog)
            .into_iter()
            .filter_map(|parent| first_strong(parent))
            .collect();
        if !worklog_authors.is_empty() {
            events
                .entry(JiraEvent::Worklog)
                .or_default()
                .extend(worklog_authors);
        }

        events
    }

    /// "Reporter:" row of the issue field table.
    fn reporter_from_fields(&self, root: ElementRef<'_>) -> Option<String> {
        for row in elements(root, "tr").filter(|tr| class_matches(*tr, &self.row_class)) {
            let label = elements(row, "td").find(|td| class_matches(*td, &self.label_class));
            let Some(label) = label else {
                continue;
            };
            if !joined_text(label, " ").to_lowercase().contains("reporter:") {
                continue;
            }
            let content = elements(row, "td").find(|td| class_matches(*td, &self.content_class))?;
            let name = match elements(content, "a").next() {
                Some(a) => joined_text(a, ""),
                None => joined_text(content, ""),
            };
            return non_empty(name);
        }
        None
    }

    /// Author of the first "Changes by" block that touches the assignee.
    fn assignee_change_author(&self, root: ElementRef<'_>) -> Option<String> {
        text_node_parents(root, &self.changes_by)
            .into_iter()
            .find(|block| joined_text(*block, " ").to_lowercase().contains("assignee:"))
            .and_then(first_strong)
    }

    fn comment_authors(&self, root: ElementRef<'_>) -> BTreeSet<String> {
        let mut authors = BTreeSet::new();
        for heading in headings(root, &self.comment_heading) {
            let Some(table) = next_element_after(root, heading, "table") else {
                continue;
            };
            for strong in elements(table, "strong") {
                let parent_text = strong
                    .parent()
                    .and_then(ElementRef::wrap)
                    .map(|p| joined_text(p, " ").to_lowercase())
                    .unwrap_or_default();
                if parent_text.contains(" on ") {
                    if let Some(name) = non_empty(joined_text(strong, "")) {
                        authors.insert(name);
                    }
                }
            }
        }
        authors
    }

    fn description_editors(&self, root: ElementRef<'_>) -> BTreeSet<String> {
        headings(root, &self.update_heading)
            .into_iter()
            .filter_map(|heading| next_element_after(root, heading, "table"))
            .filter(|table| {
                joined_text(*table, " ")
                    .to_lowercase()
                    .contains("description:")
            })
            .filter_map(first_strong)
            .collect()
    }

    fn update_authors(&self, root: ElementRef<'_>) -> BTreeSet<String> {
        headings(root, &self.update_heading)
            .into_iter()
            .filter_map(|heading| next_element_after(root, heading, "table"))
            .flat_map(|table| text_node_parents(table, &self.changes_by))
            .filter_map(first_strong)
            .collect()
    }
}

fn render_summary(header: &str, events: &BTreeMap<JiraEvent, BTreeSet<String>>) -> String {
    // Authors keep first-appearance order while walking event types in render order.
    let mut by_author: Vec<(&str, Vec<JiraEvent>)> = Vec::new();
    for event in JiraEvent::RENDER_ORDER {
        let Some(authors) = events.get(&event) else {
            continue;
        };
        for author in authors {
            match by_author.iter_mut().find(|(a, _)| *a == author.as_str()) {
                Some((_, list)) => list.push(event),
                None => by_author.push((author.as_str(), vec![event])),
            }
        }
    }

    let mut lines = vec![header.to_string(), String::new()];
    for (author, author_events) in by_author {
        lines.push(format!("{}:", escape_html(author)));
        lines.extend(author_events.iter().map(|e| e.summary_line().to_string()));
        lines.push(String::new());
    }
    while lines.last().map(|l| l.trim().is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n")
}

fn elements<'a>(root: ElementRef<'a>, name: &'a str) -> impl Iterator<Item = ElementRef<'a>> {
    root.descendants()
        .filter_map(ElementRef::wrap)
        .filter(move |e| e.value().name() == name)
}

fn headings<'a>(root: ElementRef<'a>, re: &Regex) -> Vec<ElementRef<'a>> {
    elements(root, "h2")
        .filter(|h| re.is_match(&joined_text(*h, " ")))
        .collect()
}

/// First `name` element after `anchor` in document order.
fn next_element_after<'a>(
    root: ElementRef<'a>,
    anchor: ElementRef<'a>,
    name: &str,
) -> Option<ElementRef<'a>> {
    root.descendants()
        .skip_while(|n| n.id() != anchor.id())
        .skip(1)
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == name)
}

/// Parent elements of text nodes matching `re`, in document order.
fn text_node_parents<'a>(root: ElementRef<'a>, re: &Regex) -> Vec<ElementRef<'a>> {
    root.descendants()
        .filter(|n| matches!(n.value(), Node::Text(t) if re.is_match(t)))
        .filter_map(|n| n.parent().and_then(ElementRef::wrap))
        .collect()
}

fn strong_with_parent_text(root: ElementRef<'_>, needle: &str) -> Option<String> {
    elements(root, "strong")
        .find(|s| {
            s.parent()
                .and_then(ElementRef::wrap)
                .map(|p| joined_text(p, " ").to_lowercase().contains(needle))
                .unwrap_or(false)
        })
        .and_then(|s| non_empty(joined_text(s, "")))
}

fn first_strong(el: ElementRef<'_>) -> Option<String> {
    elements(el, "strong")
        .next()
        .and_then(|s| non_empty(joined_text(s, "")))
}

fn class_matches(el: ElementRef<'_>, re: &Regex) -> bool {
    let Some(class_attr) = el.value().attr("class") else {
        return false;
    };
    re.is_match(class_attr) || el.value().classes().any(|c| re.is_match(c))
}

/// Trimmed, non-empty text fragments joined with `sep`.
fn joined_text(el: ElementRef<'_>, sep: &str) -> String {
    el.text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(sep)
}

/// Document text one fragment per line, without script/style contents.
fn visible_text(root: ElementRef<'_>) -> String {
    root.descendants()
        .filter_map(|n| match n.value() {
            Node::Text(t) => {
                let hidden = n
                    .ancestors()
                    .filter_map(ElementRef::wrap)
                    .any(|e| matches!(e.value().name(), "script" | "style"));
                let s = t.trim();
                (!hidden && !s.is_empty()).then(|| s.to_string())
            }
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
