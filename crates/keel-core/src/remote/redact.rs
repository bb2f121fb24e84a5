use std::fmt;
use zeroize::Zeroizing;

const MAX_PASSES: usize = 4;

/// Replaces every exact occurrence of a known secret value with
/// [`RedactionFilter::PLACEHOLDER`].
///
/// Every occurrence of every value is marked first, overlapping ones
/// included, and each maximal marked run becomes one placeholder. The
/// result is rescanned because a placeholder next to plain text can spell a
/// secret again; a line that still holds one after [`MAX_PASSES`] is
/// replaced whole.
#[derive(Clone, Default)]
pub struct RedactionFilter {
    needles: Vec<Zeroizing<String>>,
}

impl RedactionFilter {
    pub const PLACEHOLDER: &'static str = "[REDACTED]";

    /// Build a filter for `values`. Multi-line values are also registered
    /// line by line, since remote output is redacted one line at a time.
    pub fn new<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut needles: Vec<Zeroizing<String>> = Vec::new();
        for value in values {
            if value.is_empty() {
                continue;
            }
            needles.push(Zeroizing::new(value.to_string()));
            if value.contains('\n') {
                for line in value.lines() {
                    let line = line.trim_end_matches('\r');
                    if !line.trim().is_empty() {
                        needles.push(Zeroizing::new(line.to_string()));
                    }
                }
            }
        }
        needles.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        needles.dedup();
        Self { needles }
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn redact(&self, text: &str) -> String {
        if self.needles.is_empty() {
            return text.to_string();
        }
        let mut out = text.to_string();
        for _ in 0..MAX_PASSES {
            if !self.leaks(&out) {
                return out;
            }
            out = self.redact_once(&out);
        }
        if !self.leaks(&out) {
            out
        } else if !self.leaks(Self::PLACEHOLDER) {
            Self::PLACEHOLDER.to_string()
        } else {
            String::new()
        }
    }

    fn leaks(&self, text: &str) -> bool {
        self.needles.iter().any(|n| text.contains(n.as_str()))
    }

    fn redact_once(&self, text: &str) -> String {
        let mut covered = vec![false; text.len()];
        for needle in &self.needles {
            let mut from = 0;
            while let Some(pos) = text[from..].find(needle.as_str()) {
                let start = from + pos;
                covered[start..start + needle.len()].fill(true);
                // Step one char past the match start so overlaps are found.
                let step = text[start..].chars().next().map(char::len_utf8).unwrap_or(1);
                from = start + step;
            }
        }

        let mut out = String::with_capacity(text.len());
        let mut i = 0;
        while i < text.len() {
            if covered[i] {
                while i < text.len() && covered[i] {
                    i += 1;
                }
                out.push_str(Self::PLACEHOLDER);
                continue;
            }
            let ch = text[i..].chars().next().map(char::len_utf8).unwrap_or(1);
            out.push_str(&text[i..i + ch]);
            i += ch;
        }
        out
    }
}

impl fmt::Debug for RedactionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedactionFilter")
            .field("values", &self.needles.len())
            .finish()
    }
}
