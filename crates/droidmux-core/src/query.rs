//! Natural-language element queries against a [`PageSource`].
//!
//! Queries like `"login button"` or `"email text field"` name an element by
//! its visible text plus a UI-type noun. [`clean_query`] strips that noun and
//! [`find`] scores every node against what is left.

use serde::Serialize;

use crate::hierarchy::{NodeId, PageSource, PageSourceNode};

/// Two-word UI nouns, matched before single words.
const COMPOUND_NOUNS: &[[&str; 2]] = &[
    ["text", "box"],
    ["text", "field"],
    ["text", "input"],
    ["check", "box"],
    ["radio", "button"],
    ["input", "field"],
    ["search", "box"],
    ["search", "field"],
    ["edit", "text"],
    ["drop", "down"],
    ["toggle", "button"],
    ["icon", "button"],
];

const SINGLE_NOUNS: &[&str] = &[
    "button", "btn", "toggle", "switch", "box", "field", "checkbox", "icon", "link", "tab",
    "input", "dropdown", "menu", "image", "label",
];

/// Score for a case-insensitive exact (or glob) match.
pub const EXACT_SCORE: u8 = 2;
/// Score for a substring match.
pub const PARTIAL_SCORE: u8 = 1;

/// A node matched by [`find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Match {
    pub node: NodeId,
    pub score: u8,
}

/// Strip one trailing UI-type noun phrase from `text`.
///
/// Matching is case-insensitive; the remaining words keep their casing and
/// are joined by single spaces. If nothing would remain, the trimmed input
/// is returned as is.
///
/// ```
/// use droidmux_core::query::clean_query;
///
/// assert_eq!(clean_query("Login button"), "Login");
/// assert_eq!(clean_query("name text box"), "name");
/// assert_eq!(clean_query("button"), "button");
/// ```
pub fn clean_query(text: &str) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    let lower: Vec<String> = words.iter().map(|w| w.to_lowercase()).collect();
    let n = words.len();

    let compound = n >= 2
        && COMPOUND_NOUNS
            .iter()
            .any(|[a, b]| lower[n - 2] == *a && lower[n - 1] == *b);

    let keep = if compound {
        n - 2
    } else if n >= 1 && SINGLE_NOUNS.contains(&lower[n - 1].as_str()) {
        n - 1
    } else {
        n
    };

    if keep == 0 {
        return words.join(" ");
    }
    words[..keep].join(" ")
}

/// Find nodes matching `query`, best first.
///
/// The cleaned, lowercased query is compared with each node's text, content
/// description and resource id (raw, and with the package prefix removed and
/// `_`/`-` read as spaces). Ties break by shallower depth, then document
/// order. The root is never matched.
pub fn find(page: &PageSource, query: &str) -> Vec<Match> {
    let needle = clean_query(query).to_lowercase();
    if needle.is_empty() {
        return Vec::new();
    }

    let mut matches: Vec<(Match, usize)> = page
        .iter()
        .skip(1)
        .filter_map(|node| {
            let score = score_node(node, &needle);
            (score > 0).then_some((Match { node: node.id, score }, node.depth))
        })
        .collect();

    matches.sort_by(|(a, a_depth), (b, b_depth)| {
        b.score
            .cmp(&a.score)
            .then(a_depth.cmp(b_depth))
            .then(a.node.cmp(&b.node))
    });
    matches.into_iter().map(|(m, _)| m).collect()
}

/// The best match for `query`, if any.
pub fn find_best(page: &PageSource, query: &str) -> Option<Match> {
    find(page, query).into_iter().next()
}

fn score_node(node: &PageSourceNode, needle: &str) -> u8 {
    let resource_name = normalize_resource_id(&node.resource_id);
    [
        collapse(&node.text),
        collapse(&node.content_description),
        node.resource_id.to_lowercase(),
        resource_name,
    ]
    .iter()
    .filter(|candidate| !candidate.is_empty())
    .map(|candidate| score_text(candidate, needle))
    .max()
    .unwrap_or(0)
}

fn score_text(candidate: &str, needle: &str) -> u8 {
    if has_wildcard(needle) {
        return if glob_match(needle, candidate) { EXACT_SCORE } else { 0 };
    }
    if candidate == needle {
        EXACT_SCORE
    } else if candidate.contains(needle) {
        PARTIAL_SCORE
    } else {
        0
    }
}

/// `com.app:id/login_button` -> `login button`.
fn normalize_resource_id(resource_id: &str) -> String {
    let name = resource_id
        .rsplit_once('/')
        .map_or(resource_id, |(_, name)| name);
    collapse(&name.replace(['_', '-'], " "))
}

fn collapse(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Glob match with `*` (any run of chars) and `?` (one char).
fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    let (plen, tlen) = (pat.len(), txt.len());

    // dp[i][j] = pattern[..i] matches text[..j]
    let mut dp = vec![vec![false; tlen + 1]; plen + 1];
    dp[0][0] = true;
    for i in 1..=plen {
        if pat[i - 1] == '*' {
            dp[i][0] = dp[i - 1][0];
        }
    }
    for i in 1..=plen {
        for j in 1..=tlen {
            if pat[i - 1] == '*' {
                dp[i][j] = dp[i - 1][j] || dp[i][j - 1];
            } else if pat[i - 1] == '?' || pat[i - 1] == txt[j - 1] {
                dp[i][j] = dp[i - 1][j - 1];
            }
        }
    }
    dp[plen][tlen]
}
