//! Input language detection.
//!
//! Detection is informational only: the tag feeds the system prompt and
//! never fails a request. The heuristic is a deterministic script count
//! over the input's alphabetic characters; anything unrecognized falls
//! back to the configured default.

use parley_common::config::LanguageConfig;

/// Detect the language tag for a piece of user input.
///
/// When an allow-list is enforced and the detected tag is not in it, the
/// fallback tag is returned instead.
pub fn detect(text: &str, config: &LanguageConfig) -> String {
    let tag = detect_script(text).unwrap_or(&config.fallback);
    if !config.enforced.is_empty() && !config.enforced.iter().any(|t| t == tag) {
        tracing::debug!(detected = %tag, fallback = %config.fallback, "Language not accepted, using fallback");
        return config.fallback.clone();
    }
    tag.to_string()
}

/// Pick the dominant script among alphabetic characters.
fn detect_script(text: &str) -> Option<&str> {
    let mut arabic = 0usize;
    let mut han = 0usize;
    let mut cyrillic = 0usize;
    let mut latin = 0usize;

    for c in text.chars().filter(|c| c.is_alphabetic()) {
        match c {
            '\u{0600}'..='\u{06FF}' | '\u{0750}'..='\u{077F}' => arabic += 1,
            '\u{4E00}'..='\u{9FFF}' => han += 1,
            '\u{0400}'..='\u{04FF}' => cyrillic += 1,
            c if c.is_ascii_alphabetic() => latin += 1,
            _ => {}
        }
    }

    [
        (arabic, "ar"),
        (han, "zh"),
        (cyrillic, "ru"),
        (latin, "en"),
    ]
    .into_iter()
    .filter(|(count, _)| *count > 0)
    .max_by_key(|(count, _)| *count)
    .map(|(_, tag)| tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unrestricted() -> LanguageConfig {
        LanguageConfig {
            enforced: Vec::new(),
            fallback: "en".to_string(),
        }
    }

    #[test]
    fn test_detects_common_scripts() {
        let config = unrestricted();
        assert_eq!(detect("Hello there", &config), "en");
        assert_eq!(detect("مرحبا بالعالم", &config), "ar");
        assert_eq!(detect("你好世界", &config), "zh");
        assert_eq!(detect("Привет мир", &config), "ru");
    }

    #[test]
    fn test_detection_failure_falls_back() {
        let config = unrestricted();
        // Nothing alphabetic to classify: never an error, just the default.
        assert_eq!(detect("12345 !!!", &config), "en");
        assert_eq!(detect("", &config), "en");
    }

    #[test]
    fn test_enforced_list_forces_fallback() {
        let config = LanguageConfig {
            enforced: vec!["en".to_string(), "ar".to_string()],
            fallback: "en".to_string(),
        };
        assert_eq!(detect("مرحبا", &config), "ar");
        assert_eq!(detect("Привет мир", &config), "en");
    }

    #[test]
    fn test_mixed_input_picks_majority_script() {
        let config = unrestricted();
        assert_eq!(detect("ok мир мир мир", &config), "ru");
    }
}
