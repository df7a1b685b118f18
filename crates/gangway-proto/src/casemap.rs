//! IRC case-mapping functions.
//!
//! IRC uses a server-defined case-insensitive comparison where some
//! characters are considered equivalent (e.g., `[` and `{`). Which variant
//! applies is advertised through the `CASEMAPPING` ISUPPORT token; `rfc1459`
//! is the classic default.

/// A server-advertised case-mapping variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CaseMapping {
    /// ASCII lowercase plus `[`→`{`, `]`→`}`, `\`→`|`, `~`→`^`.
    #[default]
    Rfc1459,
    /// ASCII lowercase plus `[`→`{`, `]`→`}`, `\`→`|` (without the `~` pair).
    StrictRfc1459,
    /// Plain ASCII lowercase.
    Ascii,
    /// Full Unicode lowercase.
    Unicode,
    /// No folding at all (unrecognized advertised values).
    Noop,
}

impl CaseMapping {
    /// Select a mapping from a `CASEMAPPING` token value.
    ///
    /// Unrecognized values fold nothing rather than guessing.
    pub fn from_token(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "rfc1459" => CaseMapping::Rfc1459,
            "strict-rfc1459" | "rfc1459-strict" => CaseMapping::StrictRfc1459,
            "ascii" => CaseMapping::Ascii,
            "unicode" => CaseMapping::Unicode,
            _ => CaseMapping::Noop,
        }
    }

    /// Fold a single character under this mapping.
    pub fn fold_char(&self, c: char) -> char {
        match self {
            CaseMapping::Rfc1459 => match c {
                '[' => '{',
                ']' => '}',
                '\\' => '|',
                '~' => '^',
                'A'..='Z' => (c as u8 + 32) as char,
                _ => c,
            },
            CaseMapping::StrictRfc1459 => match c {
                '[' => '{',
                ']' => '}',
                '\\' => '|',
                'A'..='Z' => (c as u8 + 32) as char,
                _ => c,
            },
            CaseMapping::Ascii => c.to_ascii_lowercase(),
            // to_lowercase can expand to multiple chars; fold() handles that.
            CaseMapping::Unicode | CaseMapping::Noop => c,
        }
    }

    /// Fold a string under this mapping.
    pub fn fold(&self, s: &str) -> String {
        match self {
            CaseMapping::Unicode => s.to_lowercase(),
            CaseMapping::Noop => s.to_string(),
            _ => s.chars().map(|c| self.fold_char(c)).collect(),
        }
    }

    /// Compare two strings for equality under this mapping.
    pub fn eq(&self, a: &str, b: &str) -> bool {
        self.fold(a) == self.fold(b)
    }
}
