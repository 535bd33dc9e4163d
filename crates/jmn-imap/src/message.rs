use jmn_core::mailbox::{FetchedMail, NO_SUBJECT, UNKNOWN_SENDER};
use mailparse::{MailHeaderMap, ParsedMail};

/// Parse a raw RFC 822 message. Unreadable messages still yield an entry so
/// their UID is consumed.
pub fn parse_message(uid: u32, raw: &[u8]) -> FetchedMail {
    let parsed = match mailparse::parse_mail(raw) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(uid, "unparseable message: {e}");
            return FetchedMail {
                uid,
                subject: NO_SUBJECT.to_string(),
                from: UNKNOWN_SENDER.to_string(),
                html: String::new(),
            };
        }
    };

    FetchedMail {
        uid,
        subject: header_or(&parsed, "Subject", NO_SUBJECT),
        from: header_or(&parsed, "From", UNKNOWN_SENDER),
        html: first_html_part(&parsed).unwrap_or_default(),
    }
}

fn header_or(mail: &ParsedMail<'_>, name: &str, fallback: &str) -> String {
    mail.headers
        .get_first_value(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| fallback.to_string())
}

/// Depth-first search for the first `text/html` part, decoded to text.
fn first_html_part(mail: &ParsedMail<'_>) -> Option<String> {
    if mail.subparts.is_empty() {
        if !mail.ctype.mimetype.eq_ignore_ascii_case("text/html") {
            return None;
        }
        return match mail.get_body() {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::warn!("undecodable html part: {e}");
                None
            }
        };
    }
    mail.subparts.iter().find_map(first_html_part)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_message_yields_html_part() {
        let raw = concat!(
            "From: Jira <jira@task-cloud.ru>\r\n",
            "Subject: =?UTF-8?B?0J/RgNC40LLQtdGC?=\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"b1\"\r\n",
            "\r\n",
            "--b1\r\n",
            "Content-Type: text/plain; charset=utf-8\r\n",
            "\r\n",
            "plain body\r\n",
            "--b1\r\n",
            "Content-Type: text/html; charset=utf-8\r\n",
            "Content-Transfer-Encoding: quoted-printable\r\n",
            "\r\n",
            "<p>Issue created =3D ok</p>\r\n",
            "--b1--\r\n",
        );
        let mail = parse_message(7, raw.as_bytes());
        assert_eq!(mail.uid, 7);
        assert_eq!(mail.subject, "Привет");
        assert_eq!(mail.from, "Jira <jira@task-cloud.ru>");
        assert!(mail.html.contains("<p>Issue created = ok</p>"));
    }

    #[test]
    fn single_part_html_is_used_directly() {
        let raw = "Subject: Hi\r\nContent-Type: text/html\r\n\r\n<b>hello</b>\r\n";
        let mail = parse_message(1, raw.as_bytes());
        assert!(mail.html.contains("<b>hello</b>"));
        assert_eq!(mail.from, UNKNOWN_SENDER);
    }

    #[test]
    fn plain_text_message_has_no_html_and_default_subject() {
        let raw = "From: a@b.ru\r\nSubject:   \r\nContent-Type: text/plain\r\n\r\nhello\r\n";
        let mail = parse_message(2, raw.as_bytes());
        assert_eq!(mail.subject, NO_SUBJECT);
        assert!(mail.html.is_empty());
    }
}
