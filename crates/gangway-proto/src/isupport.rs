//! ISUPPORT parsing: the server's naming rules.
//!
//! Everything a client needs from `RPL_ISUPPORT` (005) to normalize names:
//! which prefix characters denote channels, which case mapping applies, and
//! how membership prefix symbols rank.

use std::collections::HashMap;

use crate::casemap::CaseMapping;

/// Default membership prefix pairing, used when `PREFIX` is absent or
/// inconsistent.
const DEFAULT_PREFIX_MODES: &str = "qaohv";
const DEFAULT_PREFIX_SYMBOLS: &str = "~&@%+";

/// Rank a membership mode letter as an integer power level.
///
/// q = owner/founder, a = admin/protected, o = operator, h = half-op,
/// v = voice. Unrecognized letters rank zero.
pub fn mode_power_level(letter: char) -> u32 {
    match letter {
        'q' => 95,
        'a' => 75,
        'o' => 50,
        'h' => 45,
        'v' => 1,
        _ => 0,
    }
}

/// A server's advertised naming rules, built once per registration.
///
/// Immutable after construction; a reconnect builds a fresh profile from the
/// newly advertised tokens.
#[derive(Clone, Debug)]
pub struct Isupport {
    /// Channel prefix characters (`CHANTYPES`), default `#`.
    pub chantypes: String,
    /// Case mapping (`CASEMAPPING`), default rfc1459.
    pub casemapping: CaseMapping,
    /// Membership prefix symbol → power level (`PREFIX`).
    prefixes: HashMap<char, u32>,
}

impl Default for Isupport {
    fn default() -> Self {
        Isupport::parse(&HashMap::new())
    }
}

impl Isupport {
    /// Build a profile from a 005 token map (key → value, bare keys map to
    /// an empty value).
    pub fn parse(tokens: &HashMap<String, String>) -> Self {
        let chantypes = match tokens.get("CHANTYPES") {
            Some(ct) if !ct.is_empty() => ct.clone(),
            _ => "#".to_string(),
        };
        let casemapping = tokens
            .get("CASEMAPPING")
            .map(|v| CaseMapping::from_token(v))
            .unwrap_or_default();
        let prefixes = tokens
            .get("PREFIX")
            .and_then(|v| parse_prefix_token(v))
            .unwrap_or_else(default_prefix_table);

        Isupport {
            chantypes,
            casemapping,
            prefixes,
        }
    }

    /// Fold a name under the advertised case mapping.
    pub fn fold(&self, name: &str) -> String {
        self.casemapping.fold(name)
    }

    /// Whether a name denotes a channel (vs. a direct target).
    pub fn is_channel(&self, name: &str) -> bool {
        name.chars()
            .next()
            .is_some_and(|c| self.chantypes.contains(c))
    }

    /// Power level for a membership prefix symbol; zero when unknown.
    pub fn power_level(&self, symbol: char) -> u32 {
        self.prefixes.get(&symbol).copied().unwrap_or(0)
    }

    /// Strip one leading membership prefix symbol from a NAMES entry,
    /// returning the bare nick and its power level.
    pub fn strip_member_prefix<'a>(&self, name: &'a str) -> (&'a str, u32) {
        if let Some(first) = name.chars().next() {
            if let Some(&pl) = self.prefixes.get(&first) {
                return (&name[first.len_utf8()..], pl);
            }
        }
        (name, 0)
    }
}

fn default_prefix_table() -> HashMap<char, u32> {
    build_prefix_table(DEFAULT_PREFIX_MODES, DEFAULT_PREFIX_SYMBOLS)
        .expect("default prefix table is well-formed")
}

fn build_prefix_table(modes: &str, symbols: &str) -> Option<HashMap<char, u32>> {
    if modes.is_empty()
        || symbols.is_empty()
        || modes.chars().count() != symbols.chars().count()
    {
        return None;
    }
    Some(
        modes
            .chars()
            .zip(symbols.chars())
            .map(|(m, s)| (s, mode_power_level(m)))
            .collect(),
    )
}

/// Parse a `PREFIX` value like `(ov)@+` into a symbol → power-level table.
///
/// Returns `None` on any inconsistency (missing parentheses, mismatched or
/// empty halves) so the caller falls back to the default table.
fn parse_prefix_token(value: &str) -> Option<HashMap<char, u32>> {
    let rest = value.strip_prefix('(')?;
    let (modes, symbols) = rest.split_once(')')?;
    build_prefix_table(modes, symbols)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let isupport = Isupport::default();
        assert_eq!(isupport.chantypes, "#");
        assert_eq!(isupport.casemapping, CaseMapping::Rfc1459);
        assert_eq!(isupport.power_level('@'), 50);
        assert_eq!(isupport.power_level('~'), 95);
        assert_eq!(isupport.power_level('+'), 1);
        assert_eq!(isupport.power_level('?'), 0);
    }

    #[test]
    fn test_advertised_prefix() {
        let isupport = Isupport::parse(&tokens(&[("PREFIX", "(ov)@+")]));
        assert_eq!(isupport.power_level('@'), 50);
        assert_eq!(isupport.power_level('+'), 1);
        // Not advertised, so not a prefix at all
        assert_eq!(isupport.power_level('~'), 0);
    }

    #[test]
    fn test_malformed_prefix_falls_back() {
        for bad in ["ov)@+", "(ov@+", "(ov)@", "()", "(o)"] {
            let isupport = Isupport::parse(&tokens(&[("PREFIX", bad)]));
            assert_eq!(isupport.power_level('~'), 95, "no fallback for {:?}", bad);
            assert_eq!(isupport.power_level('%'), 45);
        }
    }

    #[test]
    fn test_chantypes() {
        let isupport = Isupport::parse(&tokens(&[("CHANTYPES", "#&")]));
        assert!(isupport.is_channel("#chan"));
        assert!(isupport.is_channel("&local"));
        assert!(!isupport.is_channel("nick"));
        assert!(!isupport.is_channel(""));
    }

    #[test]
    fn test_casemapping_switch() {
        let isupport = Isupport::parse(&tokens(&[("CASEMAPPING", "ascii")]));
        assert_eq!(isupport.fold("Nick[A]"), "nick[a]");
    }

    #[test]
    fn test_strip_member_prefix() {
        let isupport = Isupport::default();
        assert_eq!(isupport.strip_member_prefix("@alice"), ("alice", 50));
        assert_eq!(isupport.strip_member_prefix("+bob"), ("bob", 1));
        assert_eq!(isupport.strip_member_prefix("carol"), ("carol", 0));
        assert_eq!(isupport.strip_member_prefix(""), ("", 0));
    }

    #[test]
    fn test_mode_power_level_table() {
        assert_eq!(mode_power_level('q'), 95);
        assert_eq!(mode_power_level('a'), 75);
        assert_eq!(mode_power_level('o'), 50);
        assert_eq!(mode_power_level('h'), 45);
        assert_eq!(mode_power_level('v'), 1);
        assert_eq!(mode_power_level('x'), 0);
    }
}
