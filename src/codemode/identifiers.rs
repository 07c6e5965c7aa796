//! Identifier canonicalization for the code-mode surface (§4.G).
//!
//! Tool names and server names arrive as whatever the upstream calls them
//! (`get_weather`, `fetch-docs`, already-camelCase names, …). The script
//! surface needs script-safe, language-neutral identifiers; the RPC layer
//! needs the original name back verbatim. Both directions are kept total by
//! storing the reverse mapping alongside the canonical surface rather than
//! trying to invert the transform algorithmically.

use std::collections::HashMap;

/// Split on `_`/`-` (and existing camelCase boundaries) and re-join in
/// camelCase, e.g. `get_weather` -> `getWeather`, `fetch-docs` -> `fetchDocs`.
pub fn to_camel_case(original: &str) -> String {
    let words = split_words(original);
    let mut out = String::new();
    for (i, word) in words.iter().enumerate() {
        if i == 0 {
            out.push_str(&word.to_lowercase());
        } else {
            out.push_str(&capitalize(word));
        }
    }
    if out.is_empty() {
        out.push_str("tool");
    }
    out
}

/// Same splitting, joined in PascalCase, used for server namespace names,
/// e.g. `weather-server` -> `WeatherServer`.
pub fn to_pascal_case(original: &str) -> String {
    let words = split_words(original);
    let mut out: String = words.iter().map(|word| capitalize(word)).collect();
    if out.is_empty() {
        out.push_str("Server");
    }
    out
}

fn split_words(original: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for ch in original.chars() {
        if ch == '_' || ch == '-' || ch == ' ' {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if ch.is_uppercase() && prev_lower {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        }
        current.push(ch);
        prev_lower = ch.is_lowercase() || ch.is_numeric();
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase(),
        None => String::new(),
    }
}

/// A reversible map from canonical script identifiers back to the original
/// name they were derived from, scoped to one namespace (one server's tools,
/// or the set of server names).
#[derive(Debug, Clone, Default)]
pub struct IdentifierMap {
    canonical_to_original: HashMap<String, String>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `original` under its canonical form, disambiguating
    /// collisions (two distinct originals canonicalizing to the same
    /// identifier) by appending a numeric suffix so the mapping stays total
    /// and lossless.
    pub fn insert(&mut self, canonical: String, original: String) -> String {
        if !self.canonical_to_original.contains_key(&canonical) {
            self.canonical_to_original.insert(canonical.clone(), original);
            return canonical;
        }
        let mut suffix = 2;
        loop {
            let candidate = format!("{canonical}{suffix}");
            if !self.canonical_to_original.contains_key(&candidate) {
                self.canonical_to_original.insert(candidate.clone(), original);
                return candidate;
            }
            suffix += 1;
        }
    }

    pub fn original_of(&self, canonical: &str) -> Option<&str> {
        self.canonical_to_original.get(canonical).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_to_camel_case() {
        assert_eq!(to_camel_case("get_weather"), "getWeather");
    }

    #[test]
    fn kebab_case_to_camel_case() {
        assert_eq!(to_camel_case("fetch-docs"), "fetchDocs");
    }

    #[test]
    fn already_camel_case_is_idempotent() {
        assert_eq!(to_camel_case("getWeather"), "getWeather");
    }

    #[test]
    fn server_name_to_pascal_case() {
        assert_eq!(to_pascal_case("weather-server"), "WeatherServer");
    }

    #[test]
    fn collision_gets_disambiguating_suffix() {
        let mut map = IdentifierMap::new();
        let first = map.insert("getWeather".to_string(), "get_weather".to_string());
        let second = map.insert("getWeather".to_string(), "getWeather".to_string());
        assert_eq!(first, "getWeather");
        assert_eq!(second, "getWeather2");
        assert_eq!(map.original_of("getWeather"), Some("get_weather"));
        assert_eq!(map.original_of("getWeather2"), Some("getWeather"));
    }
}
