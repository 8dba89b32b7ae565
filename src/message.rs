//! Commit message engine
//!
//! A [`Message`] is a body plus an ordered, case-insensitive multimap of
//! trailers (`Key: value` lines at the end of the message). Parsing walks the
//! message backwards so trailers are only recognized in the final block, and
//! PR descriptions may hide everything after a Markdown thematic break.

use crate::types::{PrCommit, PullRequest};
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

/// `Key: value` trailer line
static HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z-]+): (.*)$").unwrap_or_else(|e| unreachable!("invalid regex: {e}"))
});

/// Line which could be a SETEX heading underline rather than a break
static SETEX_UNDERLINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^ {0,3}[-=]+ *$").unwrap_or_else(|e| unreachable!("invalid regex: {e}"))
});

const CO_AUTHORED_BY: &str = "Co-authored-by";

/// Ordered trailers, keys compared case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Empty trailer set
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Whether there are no trailers
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a trailer
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// Append a trailer unless the same key/value pair is already present
    pub fn add_unique(&mut self, key: &str, value: &str) {
        if !self.get_all(key).contains(&value) {
            self.add(key, value);
        }
    }

    /// Every value of `key`, in insertion order
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Remove every value of `key`, returning the first one
    pub fn pop(&mut self, key: &str) -> Option<String> {
        let first = self.get_all(key).first().map(|v| (*v).to_string());
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        first
    }

    /// Distinct keys, normalized to `Capitalized-lowercase` form, in first-seen order
    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for (k, _) in &self.entries {
            let k = capitalize(k);
            if !keys.contains(&k) {
                keys.push(k);
            }
        }
        keys
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
    })
}

/// Markdown thematic break: up to three spaces, then three or more of the
/// same `*`, `_` or `-`, optionally separated by spaces or tabs
pub fn is_thematic_break(line: &str) -> bool {
    let rest = line.trim_start_matches(' ');
    if line.len() - rest.len() > 3 {
        return false;
    }
    let Some(marker @ ('*' | '_' | '-')) = rest.chars().next() else {
        return false;
    };
    let mut count = 0;
    for c in rest.chars() {
        match c {
            c if c == marker => count += 1,
            ' ' | '\t' => {}
            _ => return false,
        }
    }
    count >= 3
}

/// A parsed commit message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    body: String,
    /// Trailers
    pub headers: Headers,
}

impl Message {
    /// Message from a body (stripped) and trailers
    pub fn new(body: &str, headers: Headers) -> Self {
        Self {
            body: body.trim().to_string(),
            headers,
        }
    }

    /// Parse a commit message
    pub fn from_message(message: &str) -> Self {
        Self::parse(message, false)
    }

    /// Parse a PR description, dropping everything after a thematic break
    pub fn from_pr_message(message: &str) -> Self {
        Self::parse(message, true)
    }

    fn parse(message: &str, handle_break: bool) -> Self {
        let lines: Vec<&str> = message.lines().collect();
        let Some((&title, rest)) = lines.split_first() else {
            return Self::default();
        };

        let mut in_headers = true;
        let mut maybe_setex: Option<&str> = None;
        let mut headers = Vec::new();
        let mut body: Vec<&str> = Vec::new();

        for &line in rest.iter().rev() {
            if let Some(underline) = maybe_setex.take() {
                // a non-empty line above makes it a heading, otherwise it was
                // a break and everything below goes away
                if line.is_empty() {
                    body.clear();
                } else {
                    body.push(underline);
                }
            }

            if line.is_empty() {
                if !in_headers && body.last().is_some_and(|l| !l.is_empty()) {
                    body.push(line);
                }
                continue;
            }

            if handle_break && is_thematic_break(line) {
                if SETEX_UNDERLINE.is_match(line) {
                    maybe_setex = Some(line);
                } else {
                    body.clear();
                }
                continue;
            }

            if let Some(caps) = HEADER.captures(line) {
                let key = &caps[1];
                if in_headers || key.eq_ignore_ascii_case(CO_AUTHORED_BY) {
                    headers.push((key.to_string(), caps[2].to_string()));
                    continue;
                }
            }

            body.push(line);
            in_headers = false;
        }

        if body.last().is_some_and(|l| !l.is_empty()) {
            body.push("");
        }
        body.push(title);
        body.reverse();
        headers.reverse();

        Self::new(&body.join("\n"), Headers { entries: headers })
    }

    /// Body, without trailers, stripped
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Append text to the body
    pub fn append(&mut self, text: &str) {
        self.body.push_str(text);
        self.body = self.body.trim().to_string();
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body.trim_end();
        if self.headers.is_empty() {
            return writeln!(f, "{body}");
        }

        write!(f, "{body}\n\n")?;
        let mut keys = self.headers.keys();
        // GitHub only recognizes co-authors at the very end
        keys.sort_by_key(|k| k == CO_AUTHORED_BY);
        for key in keys {
            for value in self.headers.get_all(&key) {
                writeln!(f, "{key}: {value}")?;
            }
        }
        Ok(())
    }
}

/// Whether `message` references `pr`
///
/// A short reference (`#123` after a space, or `owner/repo#123`) is enough
/// unless `full_reference` is set.
pub fn is_mentioned(message: &str, pr: &PullRequest, full_reference: bool) -> bool {
    let pattern = if full_reference {
        format!(r"\b{}\b", regex::escape(&pr.display_name()))
    } else {
        format!(
            r"( |\b{})#{}\b",
            regex::escape(&pr.repository),
            pr.number
        )
    };
    Regex::new(&pattern).is_ok_and(|re| re.is_match(message))
}

/// Where the merge message starts from
#[derive(Debug, Clone, Copy)]
pub enum MessageSource<'a> {
    /// The PR title and description (thematic breaks honored)
    PullRequest,
    /// An existing commit message
    Commit(&'a str),
}

/// Message for the commit recording `pr` in the target branch
///
/// Adds a `closes` reference when the PR is not already mentioned, a
/// `Related` trailer for each linked PR, and the reviewer's sign-off.
pub fn build_merge_message(
    pr: &PullRequest,
    source: MessageSource<'_>,
    related: &[PullRequest],
) -> Message {
    let (text, mut message) = match source {
        MessageSource::PullRequest => (pr.message.as_str(), Message::from_pr_message(&pr.message)),
        MessageSource::Commit(text) => (text, Message::from_message(text)),
    };

    if !is_mentioned(text, pr, false) {
        message.append(&format!("\n\ncloses {}", pr.display_name()));
    }

    for other in related {
        if !is_mentioned(text, other, true) {
            message.headers.add("Related", other.display_name());
        }
    }

    if let Some(reviewer) = &pr.reviewed_by {
        message
            .headers
            .add("signed-off-by", format!("{} <{}>", reviewer.name, reviewer.email));
    }

    message
}

/// Add a `Part-of` trailer pointing at `pr` to commits that do not mention it
pub fn add_self_references(pr: &PullRequest, commits: &mut [PrCommit]) {
    for commit in commits {
        if is_mentioned(&commit.message, pr, false) {
            continue;
        }
        let mut message = Message::from_message(&commit.message);
        message.headers.pop("Part-Of");
        message.headers.add("Part-Of", pr.display_name());
        commit.message = message.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PrState, Priority, Reviewer, Signature};

    fn pr(message: &str) -> PullRequest {
        PullRequest {
            id: 1,
            repository: "acme/app".into(),
            number: 42,
            target: "main".into(),
            author: "dev".into(),
            head: "0".repeat(40),
            label: "dev:feature".into(),
            message: message.into(),
            draft: false,
            squash: true,
            merge_method: None,
            method_warned: false,
            priority: Priority::Normal,
            state: PrState::Ready,
            reviewed_by: None,
            delegates: Default::default(),
            batch: None,
            commits_map: Default::default(),
            synced_tags: None,
        }
    }

    #[test]
    fn test_thematic_breaks() {
        assert!(is_thematic_break("---"));
        assert!(is_thematic_break("   * * *"));
        assert!(is_thematic_break("_\t_ _  "));
        assert!(!is_thematic_break("    ---"));
        assert!(!is_thematic_break("--"));
        assert!(!is_thematic_break("-*-"));
        assert!(!is_thematic_break("--- x"));
    }

    #[test]
    fn test_trailers_only_in_last_block() {
        let m = Message::from_message("title\n\nKey: not a trailer\nbody\n\nFoo: bar\nBaz: qux");
        assert_eq!(m.body(), "title\n\nKey: not a trailer\nbody");
        assert_eq!(m.headers.get_all("foo"), vec!["bar"]);
        assert_eq!(m.headers.get_all("baz"), vec!["qux"]);
    }

    #[test]
    fn test_co_authored_by_anywhere() {
        let m = Message::from_message("title\n\nCo-authored-by: A <a@x>\nbody text");
        assert_eq!(m.body(), "title\n\nbody text");
        assert_eq!(m.headers.get_all("co-authored-by"), vec!["A <a@x>"]);
    }

    #[test]
    fn test_display_capitalizes_and_puts_co_authors_last() {
        let mut headers = Headers::new();
        headers.add("Co-Authored-By", "B <b@x>");
        headers.add("signed-off-by", "R <r@x>");
        headers.add("PART-OF", "acme/app#1");
        let m = Message::new("title\n\nbody\n", headers);
        assert_eq!(
            m.to_string(),
            "title\n\nbody\n\nSigned-off-by: R <r@x>\nPart-of: acme/app#1\nCo-authored-by: B <b@x>\n"
        );
    }

    #[test]
    fn test_roundtrip_is_stable() {
        for text in [
            "title",
            "title\n\nbody",
            "title\nno blank line\n\nFoo: bar",
            "title\n\n\n\nbody\n\n\nmore\n\nSigned-off-by: x <x@y>\nCo-authored-by: z <z@y>\n",
            "title\n\n---\nnot a break for commits",
        ] {
            let once = Message::from_message(text);
            let twice = Message::from_message(&once.to_string());
            assert_eq!(once, twice, "{text:?}");
        }
    }

    #[test]
    fn test_pr_message_break_drops_rest() {
        let m = Message::from_pr_message("title\n\nkeep me\n\n***\n\ninternal notes");
        assert_eq!(m.body(), "title\n\nkeep me");
    }

    #[test]
    fn test_setex_heading_is_kept() {
        let m = Message::from_pr_message("title\n\nHeading\n-------\n\ntext");
        assert_eq!(m.body(), "title\n\nHeading\n-------\n\ntext");
    }

    #[test]
    fn test_setex_lookalike_after_blank_is_break() {
        let m = Message::from_pr_message("title\n\nkept\n\n---\nhidden");
        assert_eq!(m.body(), "title\n\nkept");
    }

    #[test]
    fn test_is_mentioned() {
        let p = pr("t");
        assert!(is_mentioned("fixes #42", &p, false));
        assert!(is_mentioned("see acme/app#42.", &p, false));
        assert!(!is_mentioned("see #421", &p, false));
        assert!(!is_mentioned("issue#42", &p, false));
        assert!(!is_mentioned("fixes #42", &p, true));
        assert!(is_mentioned("part of acme/app#42", &p, true));
    }

    #[test]
    fn test_build_merge_message_adds_closes_and_signoff() {
        let mut p = pr("Fix the thing\n\nLonger explanation");
        p.reviewed_by = Some(Reviewer {
            login: "rev".into(),
            name: "Rev Iewer".into(),
            email: "rev@example.com".into(),
        });
        let mut other = pr("x");
        other.repository = "acme/lib".into();
        other.number = 7;

        let m = build_merge_message(&p, MessageSource::PullRequest, &[other]);
        assert_eq!(
            m.to_string(),
            "Fix the thing\n\nLonger explanation\n\ncloses acme/app#42\n\n\
             Related: acme/lib#7\nSigned-off-by: Rev Iewer <rev@example.com>\n"
        );
    }

    #[test]
    fn test_build_merge_message_skips_existing_reference() {
        let p = pr("Fix #42");
        let m = build_merge_message(&p, MessageSource::PullRequest, &[]);
        assert_eq!(m.to_string(), "Fix #42\n");
    }

    #[test]
    fn test_add_self_references_replaces_part_of() {
        let p = pr("t");
        let sig = Signature::new("a", "a@x");
        let mut commits = vec![
            PrCommit {
                sha: "1".into(),
                parents: vec![],
                message: "one\n\nPart-of: other/repo#3".into(),
                author: sig.clone(),
                committer: sig.clone(),
            },
            PrCommit {
                sha: "2".into(),
                parents: vec![],
                message: "two, see #42".into(),
                author: sig.clone(),
                committer: sig,
            },
        ];
        add_self_references(&p, &mut commits);
        assert_eq!(commits[0].message, "one\n\nPart-of: acme/app#42\n");
        assert_eq!(commits[1].message, "two, see #42");
    }
}
