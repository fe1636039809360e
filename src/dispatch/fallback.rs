use std::collections::HashMap;

// Static map of a requested model to a lower-tier substitute, used when the
// requested model cannot be served anywhere in the pool. Config entries merge
// over the built-ins.
pub struct FallbackModelMap {
    map: HashMap<String, String>,
}

impl FallbackModelMap {
    pub fn new(overrides: &HashMap<String, String>) -> Self {
        let mut map: HashMap<String, String> = [
            ("claude-opus-4-5", "claude-sonnet-4-5"),
            ("claude-opus-4-5-thinking", "claude-sonnet-4-5-thinking"),
            ("gemini-3-pro", "gemini-3-flash"),
            ("gemini-3-pro-preview", "gemini-3-flash-preview"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        for (from, to) in overrides {
            map.insert(from.clone(), to.clone());
        }
        Self { map }
    }

    pub fn fallback_for(&self, model: &str) -> Option<&str> {
        self.map.get(model).map(String::as_str)
    }
}

impl Default for FallbackModelMap {
    fn default() -> Self {
        Self::new(&HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_pairs_resolve() {
        let map = FallbackModelMap::default();
        assert_eq!(map.fallback_for("claude-opus-4-5"), Some("claude-sonnet-4-5"));
        assert_eq!(map.fallback_for("gemini-3-pro"), Some("gemini-3-flash"));
        assert_eq!(map.fallback_for("claude-sonnet-4-5"), None);
    }

    #[test]
    fn overrides_replace_builtins() {
        let mut overrides = HashMap::new();
        overrides.insert("gemini-3-pro".to_string(), "gemini-2.5-flash".to_string());
        let map = FallbackModelMap::new(&overrides);
        assert_eq!(map.fallback_for("gemini-3-pro"), Some("gemini-2.5-flash"));
    }
}
