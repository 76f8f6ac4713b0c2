//! Card identities and their wire encoding.
//!
//! A card is identified either by a flat counter assigned by the server
//! ([`NamingMode::Flat`]) or by a dotted path built up as the card's
//! descriptor travels upward through nested local decks
//! ([`NamingMode::Hierarchical`]).
//!
//! # Wire form
//!
//! Labels on the wire always end with the path terminator `.`. A label
//! without it is either empty or was truncated by a short read, and the
//! descriptor it came with is discarded. The terminator (and the leading
//! separator) never reach a human:
//!
//! ```text
//! wire ".3.child."  ──display──►  "3.child"
//! wire "."          ──display──►  ""          (root card)
//! ```
//!
//! # Forwarding
//!
//! A card client numbers each local connection `K` and forwards every label
//! it receives on that connection upward as `.K.<label>`, so a descendant
//! that mints `child.` inside card 3 arrives at the server as `.3.child.`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Path separator and wire terminator.
pub const SEPARATOR: char = '.';

/// Label of the card a card client mints for its own child.
pub const ROOT_LABEL: &str = ".";

/// How the server assigns identities to new cards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamingMode {
    /// Incrementing integer per accepted card; labels are only validated.
    Flat,
    /// The validated wire label is the card's identity.
    #[default]
    Hierarchical,
}

impl NamingMode {
    /// Parse a mode name as used in the config file and environment.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" | "number" | "numbered" => Some(Self::Flat),
            "hierarchical" | "path" => Some(Self::Hierarchical),
            _ => None,
        }
    }
}

/// Hierarchical card path, stored in wire form (terminator included).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CardPath(String);

impl CardPath {
    /// Build a path from a wire label, rejecting malformed labels.
    pub fn from_wire(label: &str) -> Option<Self> {
        validate_label(label).map(|l| Self(l.to_owned()))
    }

    /// The wire form, e.g. `".3.child."`.
    pub fn as_wire(&self) -> &str {
        &self.0
    }

    /// Human-facing form with the separators at either end removed.
    pub fn display_name(&self) -> &str {
        display_name(&self.0)
    }

    /// `true` for the top-level card (`"."`).
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_LABEL
    }
}

impl fmt::Display for CardPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Identity of a live card.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CardId {
    /// Flat mode: monotonic counter, the first card is 0.
    Number(u64),
    /// Hierarchical mode: dotted path.
    Path(CardPath),
}

impl CardId {
    /// Identity of the card that receives input the device cannot attribute
    /// to any particular card.
    pub fn root(mode: NamingMode) -> Self {
        match mode {
            NamingMode::Flat => Self::Number(0),
            NamingMode::Hierarchical => Self::Path(CardPath(ROOT_LABEL.to_owned())),
        }
    }

    /// `true` if this is the root card in either naming mode.
    pub fn is_root(&self) -> bool {
        match self {
            Self::Number(n) => *n == 0,
            Self::Path(p) => p.is_root(),
        }
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Path(p) => p.fmt(f),
        }
    }
}

/// Check the wire shape of a label: non-empty, terminated by `.` and free
/// of NUL bytes.
///
/// Returns the label unchanged when valid.
pub fn validate_label(label: &str) -> Option<&str> {
    (!label.is_empty() && label.ends_with(SEPARATOR) && !label.contains('\0')).then_some(label)
}

/// Strip the leading and trailing separator for display.
pub fn display_name(wire: &str) -> &str {
    let s = wire.strip_suffix(SEPARATOR).unwrap_or(wire);
    s.strip_prefix(SEPARATOR).unwrap_or(s)
}

/// Rename a label received on local connection `index` before passing it
/// to the upper deck.
///
/// Returns `None` for malformed labels; their descriptor must be dropped.
pub fn forward_label(index: u64, label: &str) -> Option<String> {
    let label = validate_label(label)?;
    let rest = label.strip_prefix(SEPARATOR).unwrap_or(label);
    Some(format!("{SEPARATOR}{index}{SEPARATOR}{rest}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_label_requires_terminator() {
        assert_eq!(validate_label("foo."), Some("foo."));
        assert_eq!(validate_label("."), Some("."));
        assert_eq!(validate_label(""), None);
        assert_eq!(validate_label("foo"), None);
        assert_eq!(validate_label(".foo"), None);
        assert_eq!(validate_label("a\0b."), None);
    }

    #[test]
    fn test_forward_label_prefixes_parent_index() {
        assert_eq!(forward_label(3, "child.").as_deref(), Some(".3.child."));
        assert_eq!(forward_label(3, ".child.").as_deref(), Some(".3.child."));
        assert_eq!(forward_label(0, ".").as_deref(), Some(".0."));
        assert_eq!(forward_label(7, ".2.x.").as_deref(), Some(".7.2.x."));
    }

    #[test]
    fn test_forward_label_rejects_truncated() {
        assert_eq!(forward_label(1, "chi"), None);
        assert_eq!(forward_label(1, ""), None);
    }

    #[test]
    fn test_display_strips_separators() {
        assert_eq!(display_name(".3.child."), "3.child");
        assert_eq!(display_name("."), "");
        assert_eq!(display_name("child."), "child");

        let path = CardPath::from_wire(".3.child.").expect("valid label");
        assert_eq!(path.to_string(), "3.child");
        assert_eq!(path.as_wire(), ".3.child.");
        assert!(!path.is_root());
    }

    #[test]
    fn test_minted_name_round_trip_through_display() {
        let wire = forward_label(3, "child.").expect("valid label");
        let id = CardId::Path(CardPath::from_wire(&wire).expect("valid wire label"));
        assert_eq!(id.to_string(), "3.child");
    }

    #[test]
    fn test_root_ids() {
        assert!(CardId::root(NamingMode::Flat).is_root());
        assert!(CardId::root(NamingMode::Hierarchical).is_root());
        assert!(!CardId::Number(4).is_root());
        assert_eq!(CardId::root(NamingMode::Hierarchical).to_string(), "");
    }

    #[test]
    fn test_naming_mode_parse() {
        assert_eq!(NamingMode::parse("Flat"), Some(NamingMode::Flat));
        assert_eq!(NamingMode::parse(" hierarchical "), Some(NamingMode::Hierarchical));
        assert_eq!(NamingMode::parse("tree"), None);
    }
}
