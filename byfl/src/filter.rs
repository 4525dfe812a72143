//! Function selection.
//!
//! Demangled C++ names contain commas (`f(int, char)`), so a name given on a
//! comma-separated list may arrive split across several elements. Elements
//! are glued back together until every bracket pair balances.
use std::collections::BTreeSet;

use log::debug;

use crate::utils::conf::InstrumentOptions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionFilter {
    All,
    Include(BTreeSet<String>),
    Exclude(BTreeSet<String>),
}

/// `name` without any whitespace.
fn normalize(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Operator mnemonics that may follow `operator`, longest first.
const OPERATOR_TOKENS: &[&str] = &[
    "<<=", ">>=", "<=>", "->*", "->", "<<", ">>", "<=", ">=", "==", "!=", "&&", "||", "++", "--",
    "+=", "-=", "*=", "/=", "%=", "&=", "|=", "^=", "()", "[]", "<", ">", "+", "-", "*", "/", "%",
    "^", "&", "|", "~", "!", "=",
];

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Length of the operator mnemonic at the start of `rest`, if any.
fn operator_token(rest: &str) -> usize {
    let trimmed = rest.trim_start();
    let skipped = rest.len() - trimmed.len();
    OPERATOR_TOKENS
        .iter()
        .find(|token| trimmed.starts_with(*token))
        .map_or(0, |token| skipped + token.len())
}

/// Bracket depth at the end of `text`. The mnemonic of an `operator<<` style
/// name is not a bracket.
fn balance(text: &str) -> i64 {
    let mut depth = 0;
    let mut rest = text;
    let mut previous: Option<char> = None;

    while let Some(c) = rest.chars().next() {
        if let Some(tail) = rest.strip_prefix("operator")
            && !previous.is_some_and(is_ident)
            && !tail.chars().next().is_some_and(is_ident)
        {
            let skip = operator_token(tail);
            rest = &tail[skip..];
            previous = Some('r');
            continue;
        }

        depth += match c {
            '(' | '<' | '[' => 1,
            ')' | '>' | ']' => -1,
            _ => 0,
        };
        previous = Some(c);
        rest = &rest[c.len_utf8()..];
    }
    depth
}

/// Rejoin list elements that belong to one name and normalize the result.
pub fn recombine_names(elements: &[String]) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    let mut pending: Option<String> = None;

    for element in elements {
        let current = match pending.take() {
            Some(mut prefix) => {
                prefix.push(',');
                prefix.push_str(element);
                prefix
            }
            None => element.clone(),
        };

        if balance(&current) > 0 {
            pending = Some(current);
        } else {
            names.insert(normalize(&current));
        }
    }

    if let Some(rest) = pending {
        debug!("unbalanced function name {:?} in filter list", rest);
        names.insert(normalize(&rest));
    }
    names.retain(|name| !name.is_empty());
    names
}

impl FunctionFilter {
    /// Filter described by validated options.
    pub fn from_options(options: &InstrumentOptions) -> Self {
        if !options.include.is_empty() {
            FunctionFilter::Include(recombine_names(&options.include))
        } else if !options.exclude.is_empty() {
            FunctionFilter::Exclude(recombine_names(&options.exclude))
        } else {
            FunctionFilter::All
        }
    }

    pub fn should_instrument(&self, name: &str) -> bool {
        match self {
            FunctionFilter::All => true,
            FunctionFilter::Include(names) => names.contains(&normalize(name)),
            FunctionFilter::Exclude(names) => !names.contains(&normalize(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn split_signatures_are_recombined() {
        let names = recombine_names(&list(&["foo(int", " char)", "bar", "baz<int", " std::pair<a", "b>>"]));
        let expected: BTreeSet<String> = ["foo(int,char)", "bar", "baz<int,std::pair<a,b>>"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn unbalanced_tail_is_kept() {
        let names = recombine_names(&list(&["a[", "b"]));
        assert!(names.contains("a[,b"));
    }

    #[test]
    fn include_and_exclude_select_functions() {
        let include = FunctionFilter::Include(recombine_names(&list(&["main"])));
        assert!(include.should_instrument("main"));
        assert!(!include.should_instrument("helper"));

        let exclude = FunctionFilter::Exclude(recombine_names(&list(&["foo(int", "char)"])));
        assert!(!exclude.should_instrument("foo(int, char)"));
        assert!(exclude.should_instrument("foo"));

        assert!(FunctionFilter::All.should_instrument("anything"));
    }

    #[test]
    fn operator_mnemonics_are_not_brackets() {
        let names = recombine_names(&list(&["operator<<(std::ostream&", " Foo const&)", "main"]));
        let expected: BTreeSet<String> = ["operator<<(std::ostream&,Fooconst&)", "main"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, expected);

        let exclude = FunctionFilter::Exclude(names);
        assert!(!exclude.should_instrument("main"));
        assert!(!exclude.should_instrument("operator<<(std::ostream&, Foo const&)"));

        let arrow = recombine_names(&list(&["Foo::operator->(int", " int)"]));
        assert_eq!(arrow.into_iter().collect::<Vec<_>>(), vec!["Foo::operator->(int,int)"]);

        let compare = recombine_names(&list(&["bool operator<(Foo const&", " Foo const&)", "operator<=", "x"]));
        assert!(compare.contains("booloperator<(Fooconst&,Fooconst&)"));
        assert!(compare.contains("operator<="));
        assert!(compare.contains("x"));
    }

    #[test]
    fn operator_must_be_a_whole_word() {
        let names = recombine_names(&list(&["my_operator<int", " char>", "operators(a", "b)"]));
        assert!(names.contains("my_operator<int,char>"));
        assert!(names.contains("operators(a,b)"));
    }
}
