//! HTTP response code classification.
//!
//! Every valid code is counted under its group (`2XX`, `4XX`...). Only
//! the codes in the tracked list also get a counter of their own, which
//! keeps unusual or garbage codes from growing the keyspace.

use std::collections::BTreeSet;
use thiserror::Error;

pub const DEFAULT_TRACKED_CODES: [u16; 6] = [200, 403, 404, 429, 500, 503];

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("response code {0} is not a valid HTTP status")]
pub struct InvalidResponseCode(pub i64);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResponseCodeClass {
    pub code: u16,
    pub group: String,
    pub track_exact: bool,
}

impl ResponseCodeClass {
    /// The counter labels this code increments: the group, then the
    /// exact code when it is tracked.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = vec![self.group.clone()];
        if self.track_exact {
            labels.push(self.code.to_string());
        }
        labels
    }
}

#[derive(Clone, Debug)]
pub struct ResponseCodeClassifier {
    tracked: BTreeSet<u16>,
}

impl Default for ResponseCodeClassifier {
    fn default() -> Self {
        ResponseCodeClassifier::new(DEFAULT_TRACKED_CODES)
    }
}

impl ResponseCodeClassifier {
    pub fn new(tracked: impl IntoIterator<Item = u16>) -> Self {
        ResponseCodeClassifier {
            tracked: tracked.into_iter().collect(),
        }
    }

    pub fn classify(&self, code: i64) -> Result<ResponseCodeClass, InvalidResponseCode> {
        if !(100..=599).contains(&code) {
            return Err(InvalidResponseCode(code));
        }
        let code = code as u16;
        Ok(ResponseCodeClass {
            code,
            group: format!("{}XX", code / 100),
            track_exact: self.tracked.contains(&code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{InvalidResponseCode, ResponseCodeClassifier};

    #[test]
    fn test_groups_cover_the_valid_range() {
        let classifier = ResponseCodeClassifier::default();
        for code in 100..=599i64 {
            let class = classifier.classify(code).unwrap();
            assert_eq!(class.group, format!("{}XX", code / 100));
        }
    }

    #[test]
    fn test_out_of_range_codes() {
        let classifier = ResponseCodeClassifier::default();
        for code in [-1, 0, 99, 600, 1000] {
            assert_eq!(classifier.classify(code), Err(InvalidResponseCode(code)));
        }
    }

    #[test]
    fn test_tracked_codes() {
        let classifier = ResponseCodeClassifier::default();

        let ok = classifier.classify(200).unwrap();
        assert!(ok.track_exact);
        assert_eq!(ok.labels(), vec!["2XX".to_string(), "200".to_string()]);

        let unusual = classifier.classify(209).unwrap();
        assert!(!unusual.track_exact);
        assert_eq!(unusual.labels(), vec!["2XX".to_string()]);

        let not_found = classifier.classify(404).unwrap();
        assert_eq!(not_found.group, "4XX");
        assert!(not_found.track_exact);
    }

    #[test]
    fn test_custom_tracked_list() {
        let classifier = ResponseCodeClassifier::new([418]);
        assert!(classifier.classify(418).unwrap().track_exact);
        assert!(!classifier.classify(200).unwrap().track_exact);
    }
}
