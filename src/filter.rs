//! Sentence filters.
//!
//! A filter is an ordered list of accept/deny rules matched against a
//! sentence's address field. Filters are shared between interfaces by
//! reference: duplicating an interface clones the `Arc`, not the rules.

use std::fmt;
use std::sync::Arc;

use crate::sentence::address_field;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Accept,
    Deny,
}

#[derive(Debug, Clone)]
struct Rule {
    action: Action,
    /// Pattern over the address field; `?` matches any single byte.
    pattern: Vec<u8>,
}

impl Rule {
    fn matches(&self, addr: &[u8]) -> bool {
        if addr.len() < self.pattern.len() {
            return false;
        }
        self.pattern
            .iter()
            .zip(addr)
            .all(|(&p, &a)| p == b'?' || p.eq_ignore_ascii_case(&a))
    }
}

/// Filter parse errors.
#[derive(Debug, PartialEq, Eq)]
pub enum FilterError {
    EmptyRule,
    BadPattern(String),
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterError::EmptyRule => write!(f, "empty filter rule"),
            FilterError::BadPattern(p) => write!(f, "bad filter pattern {:?}", p),
        }
    }
}

impl std::error::Error for FilterError {}

/// An ordered accept/deny sentence filter.
///
/// Rules are evaluated first match wins. A sentence matching no rule is
/// accepted when the filter consists only of deny rules, and denied as
/// soon as at least one accept rule exists.
#[derive(Debug, Clone)]
pub struct Filter {
    rules: Vec<Rule>,
    default_accept: bool,
}

impl Filter {
    /// Parses a colon-separated rule list, e.g. `-AIVDM:+GP???`.
    /// A rule without a `+`/`-` prefix accepts.
    pub fn parse(spec: &str) -> Result<Filter, FilterError> {
        let mut rules = Vec::new();
        for part in spec.split(':') {
            if part.is_empty() {
                return Err(FilterError::EmptyRule);
            }
            let (action, pat) = match part.as_bytes()[0] {
                b'+' => (Action::Accept, &part[1..]),
                b'-' => (Action::Deny, &part[1..]),
                _ => (Action::Accept, part),
            };
            if pat.is_empty() || pat.len() > 5 {
                return Err(FilterError::BadPattern(part.to_string()));
            }
            if !pat
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'?')
            {
                return Err(FilterError::BadPattern(part.to_string()));
            }
            rules.push(Rule {
                action,
                pattern: pat.as_bytes().to_vec(),
            });
        }
        let default_accept = !rules.iter().any(|r| r.action == Action::Accept);
        Ok(Filter {
            rules,
            default_accept,
        })
    }

    /// Applies the filter to a raw sentence.
    pub fn pass(&self, sentence: &[u8]) -> bool {
        let addr = address_field(sentence);
        for rule in &self.rules {
            if rule.matches(addr) {
                return rule.action == Action::Accept;
            }
        }
        self.default_accept
    }
}

/// Clones a shared filter reference, the way an interface duplication
/// clones filter state.
pub fn addfilter(f: &Option<Arc<Filter>>) -> Option<Arc<Filter>> {
    f.clone()
}

/// Applies an optional filter; no filter passes everything.
pub fn passes(f: &Option<Arc<Filter>>, sentence: &[u8]) -> bool {
    f.as_ref().map_or(true, |f| f.pass(sentence))
}
