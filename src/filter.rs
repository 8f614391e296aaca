use regex::Regex;

/// A search pattern applied to stream lines
#[derive(Clone, Debug)]
pub struct SearchFilter {
    /// The pattern string
    pub pattern: String,
    /// Whether to treat the pattern as a regex
    pub is_regex: bool,
    /// Compiled regex (if is_regex is true and pattern is valid)
    compiled: Option<Regex>,
    /// Lowercased pattern for plain matching
    folded: String,
}

impl SearchFilter {
    pub fn new(pattern: impl Into<String>, is_regex: bool) -> Self {
        let pattern = pattern.into();
        let compiled = if is_regex {
            Regex::new(&pattern).ok()
        } else {
            None
        };

        Self {
            folded: pattern.to_lowercase(),
            pattern,
            is_regex,
            compiled,
        }
    }

    /// False for a regex that did not compile
    pub fn is_valid(&self) -> bool {
        !self.is_regex || self.compiled.is_some()
    }

    /// Check if a line matches this filter
    pub fn matches(&self, line: &str) -> bool {
        if self.is_regex {
            if let Some(ref regex) = self.compiled {
                regex.is_match(line)
            } else {
                // Invalid regex, treat as substring match
                line.contains(&self.pattern)
            }
        } else {
            // Case-insensitive substring match
            line.to_lowercase().contains(&self.folded)
        }
    }

    /// Positions of every matching line
    pub fn hits<'a>(&self, lines: impl IntoIterator<Item = &'a String>) -> Vec<u64> {
        lines
            .into_iter()
            .enumerate()
            .filter(|(_, line)| self.matches(line))
            .map(|(i, _)| i as u64)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_is_case_insensitive() {
        let filter = SearchFilter::new("Error", false);
        assert!(filter.matches("an ERROR happened"));
        assert!(!filter.matches("all good"));
    }

    #[test]
    fn test_regex() {
        let filter = SearchFilter::new(r"code=\d{3}", true);
        assert!(filter.is_valid());
        assert!(filter.matches("code=500"));
        assert!(!filter.matches("code=5"));
    }

    #[test]
    fn test_invalid_regex_falls_back_to_substring() {
        let filter = SearchFilter::new("a(b", true);
        assert!(!filter.is_valid());
        assert!(filter.matches("xa(by"));
        assert!(!filter.matches("xaby"));
    }

    #[test]
    fn test_hits() {
        let lines: Vec<String> = ["warn one", "info", "WARN two"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(SearchFilter::new("warn", false).hits(&lines), vec![0, 2]);
    }
}
