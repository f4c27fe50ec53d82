//! Vendor token matching.
//!
//! The [`VendorSet`] holds the known vendor names in a fixed iteration
//! order: longest token first, ties broken alphabetically. That way
//! `"oneplus"` is tried before `"one"` and results never depend on the
//! order the backing store returns members in.

use crate::models::normalize;

const ANDROID: &str = "android";
const APPLE: &str = "apple";

/// Known vendor names, normalized and deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorSet {
    tokens: Vec<String>,
}

impl VendorSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for name in names {
            set.insert(name.as_ref());
        }
        set
    }

    /// Add a vendor. Returns `false` when it was already known or empty.
    pub fn insert(&mut self, name: &str) -> bool {
        let token = normalize(name);
        if token.is_empty() || self.contains(&token) {
            return false;
        }
        let pos = self
            .tokens
            .iter()
            .position(|t| match_order(&token, t).is_lt())
            .unwrap_or(self.tokens.len());
        self.tokens.insert(pos, token);
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tokens.iter().any(|t| t == name)
    }

    /// Tokens in match order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

fn match_order(a: &str, b: &str) -> std::cmp::Ordering {
    b.len().cmp(&a.len()).then_with(|| a.cmp(b))
}

/// Find a known vendor in the device part of a user-agent.
///
/// Only the text up to the first `)` is scanned, which is where the
/// platform and device tokens live. `context` is the current vendor/model
/// text of the record: when it mentions android, `apple` is never
/// returned, and vice versa.
pub fn extract_vendor_from_ua(
    ua: &str,
    vendors: &VendorSet,
    context: Option<&str>,
) -> Option<String> {
    let ua = ua.to_lowercase();
    let section = ua.split(')').next().unwrap_or_default();
    let context = context.map(str::to_lowercase).unwrap_or_default();

    vendors
        .iter()
        .filter(|token| section.contains(token))
        .find(|&token| {
            !(token == APPLE && context.contains(ANDROID)
                || token == ANDROID && context.contains(APPLE))
        })
        .map(str::to_string)
}

/// Strip the first vendor token found inside `model`.
///
/// Returns the cleaned model and the matched token, or `None` when the
/// model mentions no known vendor.
pub fn strip_vendor_token(model: &str, vendors: &VendorSet) -> Option<(String, String)> {
    let token = vendors.iter().find(|token| model.contains(token))?;
    Some((remove_token(model, token), token.to_string()))
}

/// Remove every occurrence of `token`, trim separators from both ends and
/// turn the inner `_` and `.` separators into spaces.
pub fn remove_token(model: &str, token: &str) -> String {
    model
        .replace(token, "")
        .trim_matches(|c| c == '_' || c == ' ' || c == '.')
        .replace(['_', '.'], " ")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vendors() -> VendorSet {
        VendorSet::new(["samsung", "apple", "android", "one", "oneplus", "lg", " Xiaomi "])
    }

    #[test]
    fn iteration_is_longest_first() {
        let set = vendors();
        let order: Vec<&str> = set.iter().collect();
        assert_eq!(
            order,
            vec!["android", "oneplus", "samsung", "xiaomi", "apple", "one", "lg"]
        );
    }

    #[test]
    fn insert_normalizes_and_dedupes() {
        let mut set = vendors();
        assert!(!set.insert("SAMSUNG"));
        assert!(!set.insert("   "));
        assert!(set.insert("Nokia"));
        assert!(set.contains("nokia"));
        assert_eq!(set.len(), 8);
    }

    #[test]
    fn strips_vendor_and_separators() {
        let set = vendors();
        assert_eq!(
            strip_vendor_token("samsung_galaxy_s9", &set),
            Some(("galaxy s9".to_string(), "samsung".to_string()))
        );
        assert_eq!(
            strip_vendor_token("oneplus.nord.2", &set),
            Some(("nord 2".to_string(), "oneplus".to_string()))
        );
        assert_eq!(strip_vendor_token("pixel 7", &set), None);
    }

    #[test]
    fn ua_scan_stops_at_first_paren() {
        let set = vendors();
        let ua = "Mozilla/5.0 (Linux; Android 12; Samsung SM-G991B) AppleWebKit/537.36";
        assert_eq!(
            extract_vendor_from_ua(ua, &set, Some("android")),
            Some("android".to_string())
        );

        let tail_only = "Mozilla/5.0 (X11) Samsung";
        assert_eq!(extract_vendor_from_ua(tail_only, &set, None), None);
    }

    #[test]
    fn never_crosses_apple_and_android() {
        let set = VendorSet::new(["apple", "android"]);
        let ua = "Dalvik (apple android)";
        assert_eq!(
            extract_vendor_from_ua(ua, &set, Some("generic android")),
            Some("android".to_string())
        );
        assert_eq!(
            extract_vendor_from_ua(ua, &set, Some("apple iphone")),
            Some("apple".to_string())
        );

        let apple_only = "Mozilla/5.0 (iPhone; apple)";
        assert_eq!(
            extract_vendor_from_ua(apple_only, &set, Some("android")),
            None
        );
    }
}
