/// Leading administrative-type words stripped by default. Longest first so
/// `KABUPATEN` wins over `KAB`.
pub const DEFAULT_QUALIFIERS: [&str; 3] = ["KABUPATEN", "KAB.", "KAB"];

/// Canonicalizes display names into dedup keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalizer {
    qualifiers: Vec<String>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(DEFAULT_QUALIFIERS)
    }
}

impl Normalizer {
    /// Qualifiers are matched case-insensitively; blanks are ignored.
    pub fn new<I, S>(qualifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut qualifiers: Vec<String> = qualifiers
            .into_iter()
            .map(|q| collapse_whitespace(&q.as_ref().to_uppercase()))
            .filter(|q| !q.is_empty())
            .collect();
        qualifiers.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        qualifiers.dedup();
        Self { qualifiers }
    }

    pub fn qualifiers(&self) -> &[String] {
        &self.qualifiers
    }

    /// Build the canonical key for a raw display name.
    ///
    /// Steps:
    /// - trim, upper-case, collapse runs of whitespace to one space
    /// - repeatedly strip a leading qualifier token, but only at a word boundary
    ///   and only when a name remains after it
    ///
    /// Never fails; the worst case is the upper-cased trimmed input.
    pub fn key(&self, raw: &str) -> String {
        let mut key = collapse_whitespace(&raw.to_uppercase());
        while let Some(rest) = self.strip_once(&key) {
            key = rest;
        }
        key
    }

    fn strip_once(&self, key: &str) -> Option<String> {
        for q in &self.qualifiers {
            let Some(rest) = key.strip_prefix(q.as_str()) else {
                continue;
            };
            let at_boundary = q.ends_with('.') || rest.starts_with(' ');
            let rest = rest.trim_start();
            if at_boundary && !rest.is_empty() {
                return Some(rest.to_string());
            }
        }
        None
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}
