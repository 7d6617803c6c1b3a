//! Frame categorization: which subsystem a frame's time belongs to.
//!
//! Rules are keyed by binary nick, then matched against the symbol name
//! (see `categories.txt` for the format). A category marked `inherit`
//! propagates to callees that have no category of their own, so time spent
//! in, say, `memcpy` under `gtk_css_*` can still be attributed to CSS.

use crate::symbol::Symbol;
use log::warn;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

const DEFAULT_RULES: &str = include_str!("categories.txt");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    #[default]
    Uncategorized,
    /// Root, process and thread rows
    Presentation,
    A11y,
    Actions,
    ContextSwitch,
    Coredump,
    Css,
    Graphics,
    Icons,
    Input,
    Io,
    Ipc,
    Javascript,
    Kernel,
    Layout,
    Locking,
    MainLoop,
    Memory,
    Paint,
    TypeSystem,
    Unwindable,
    Windowing,
}

impl Category {
    pub const ALL: [Category; 22] = [
        Category::Uncategorized,
        Category::Presentation,
        Category::A11y,
        Category::Actions,
        Category::ContextSwitch,
        Category::Coredump,
        Category::Css,
        Category::Graphics,
        Category::Icons,
        Category::Input,
        Category::Io,
        Category::Ipc,
        Category::Javascript,
        Category::Kernel,
        Category::Layout,
        Category::Locking,
        Category::MainLoop,
        Category::Memory,
        Category::Paint,
        Category::TypeSystem,
        Category::Unwindable,
        Category::Windowing,
    ];

    /// Identifier used in rule files.
    #[must_use]
    pub fn nick(self) -> &'static str {
        match self {
            Self::Uncategorized => "uncategorized",
            Self::Presentation => "presentation",
            Self::A11y => "a11y",
            Self::Actions => "actions",
            Self::ContextSwitch => "context-switch",
            Self::Coredump => "coredump",
            Self::Css => "css",
            Self::Graphics => "graphics",
            Self::Icons => "icons",
            Self::Input => "input",
            Self::Io => "io",
            Self::Ipc => "ipc",
            Self::Javascript => "javascript",
            Self::Kernel => "kernel",
            Self::Layout => "layout",
            Self::Locking => "locking",
            Self::MainLoop => "main-loop",
            Self::Memory => "memory",
            Self::Paint => "paint",
            Self::TypeSystem => "type-system",
            Self::Unwindable => "unwindable",
            Self::Windowing => "windowing",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.nick())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.nick() == s)
            .ok_or_else(|| format!("unknown category '{s}'"))
    }
}

/// A category plus whether callees inherit it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CategoryTag {
    pub category: Category,
    pub inherit: bool,
}

impl CategoryTag {
    #[must_use]
    pub fn new(category: Category) -> Self {
        Self { category, inherit: false }
    }
}

/// Assigns categories to user and kernel frames.
pub trait NodeClassifier: Send + Sync {
    /// Category for `symbol`, or `None` to fall back to inheritance.
    fn classify(&self, symbol: &Symbol) -> Option<CategoryTag>;
}

impl<T: NodeClassifier + ?Sized> NodeClassifier for &T {
    fn classify(&self, symbol: &Symbol) -> Option<CategoryTag> {
        (**self).classify(symbol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl Pattern {
    fn parse(text: &str) -> Self {
        match (text.strip_prefix('*'), text.strip_suffix('*')) {
            (Some(_), Some(_)) if text.len() >= 2 => Self::Contains(text[1..text.len() - 1].to_string()),
            (Some(rest), _) => Self::Suffix(rest.to_string()),
            (_, Some(rest)) => Self::Prefix(rest.to_string()),
            _ => Self::Exact(text.to_string()),
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(s) => name == s,
            Self::Prefix(s) => name.starts_with(s.as_str()),
            Self::Suffix(s) => name.ends_with(s.as_str()),
            Self::Contains(s) => name.contains(s.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: Pattern,
    tag: CategoryTag,
}

/// Rule table parsed from text.
#[derive(Debug, Clone, Default)]
pub struct CategoryRules {
    by_nick: HashMap<String, Vec<Rule>>,
}

impl CategoryRules {
    /// Parse rules. Lines that do not parse are logged and skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut by_nick: HashMap<String, Vec<Rule>> = HashMap::new();
        let mut current: Option<String> = None;

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(nick) = line.strip_suffix(':') {
                current = Some(nick.trim().to_string());
                continue;
            }

            let Some(nick) = current.as_ref() else {
                warn!("categories:{}: rule outside a nick group", number + 1);
                continue;
            };

            match parse_rule(line) {
                Ok(rule) => by_nick.entry(nick.clone()).or_default().push(rule),
                Err(e) => warn!("categories:{}: {e}", number + 1),
            }
        }

        Self { by_nick }
    }

    /// The built-in rule table.
    #[must_use]
    pub fn builtin() -> &'static CategoryRules {
        static RULES: OnceLock<CategoryRules> = OnceLock::new();
        RULES.get_or_init(|| Self::parse(DEFAULT_RULES))
    }

    /// First rule for `nick` matching `name`.
    #[must_use]
    pub fn lookup(&self, nick: &str, name: &str) -> Option<CategoryTag> {
        self.by_nick.get(nick)?.iter().find(|r| r.pattern.matches(name)).map(|r| r.tag)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_nick.values().map(Vec::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_rule(line: &str) -> Result<Rule, String> {
    let mut fields = line.split_whitespace();
    let pattern = fields.next().ok_or("empty rule")?;
    let category: Category = fields.next().ok_or("missing category")?.parse()?;

    let inherit = match fields.next() {
        None => false,
        Some("inherit") => true,
        Some(other) => return Err(format!("unexpected '{other}'")),
    };

    Ok(Rule { pattern: Pattern::parse(pattern), tag: CategoryTag { category, inherit } })
}

impl NodeClassifier for CategoryRules {
    fn classify(&self, symbol: &Symbol) -> Option<CategoryTag> {
        let nick = symbol.binary_nick()?;
        self.lookup(nick, symbol.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::Strings;
    use crate::symbol::SymbolKind;

    #[test]
    fn test_builtin_rules_parse() {
        let rules = CategoryRules::builtin();
        assert!(rules.len() > 50);
        assert_eq!(
            rules.lookup("GLib", "g_main_context_iteration"),
            Some(CategoryTag { category: Category::MainLoop, inherit: true })
        );
        assert_eq!(rules.lookup("libc", "malloc").map(|t| t.category), Some(Category::Memory));
        assert_eq!(rules.lookup("Linux", "futex_wait").map(|t| t.category), Some(Category::Locking));
        assert_eq!(rules.lookup("Linux", "anything_else").map(|t| t.category), Some(Category::Kernel));
        assert_eq!(rules.lookup("libc", "strlen"), None);
        assert_eq!(rules.lookup("nobody", "malloc"), None);
    }

    #[test]
    fn test_patterns() {
        assert!(Pattern::parse("g_*").matches("g_free"));
        assert!(Pattern::parse("*_alloc").matches("slab_alloc"));
        assert!(Pattern::parse("*futex*").matches("do_futex_wait"));
        assert!(Pattern::parse("*").matches("x"));
        assert!(!Pattern::parse("read").matches("readv"));
    }

    #[test]
    fn test_parse_skips_bad_lines() {
        let rules = CategoryRules::parse(
            "orphan memory\nlibfoo:\n  foo_* paint\n  bar nosuchcategory\n  baz io bogus\n",
        );
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn test_classify_uses_nick() {
        let strings = Strings::new();
        let symbol = Symbol::new(
            strings.get("gtk_css_node_validate"),
            Some(strings.get("/usr/lib64/libgtk-4.so.1")),
            Some(strings.get("GTK 4")),
            1,
            2,
            SymbolKind::User,
        );
        let tag = CategoryRules::builtin().classify(&symbol).unwrap();
        assert_eq!(tag.category, Category::Css);
        assert!(tag.inherit);
    }

    #[test]
    fn test_category_nick_round_trip() {
        for category in Category::ALL {
            assert_eq!(category.nick().parse::<Category>(), Ok(category));
        }
    }
}
