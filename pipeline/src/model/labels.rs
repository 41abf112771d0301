use strum::{Display, EnumString};

/// Closed label set for voter classification. Anything the service returns
/// outside this set is mapped to [`Religion::FALLBACK`] at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum Religion {
    Hindu,
    Christian,
    Muslim,
}

impl Religion {
    /// Default label used when validation or retries fail, guaranteeing
    /// every output cell is filled from the closed set.
    pub const FALLBACK: Religion = Religion::Hindu;

    pub fn as_str(&self) -> &'static str {
        match self {
            Religion::Hindu => "Hindu",
            Religion::Christian => "Christian",
            Religion::Muslim => "Muslim",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_whitelist_round_trip() {
        for label in [Religion::Hindu, Religion::Christian, Religion::Muslim] {
            assert_eq!(Religion::from_str(label.as_str()).unwrap(), label);
        }
    }

    #[test]
    fn test_unknown_label_rejected() {
        assert!(Religion::from_str("Jedi").is_err());
        assert!(Religion::from_str("hindu").is_err());
        assert!(Religion::from_str("").is_err());
    }
}
