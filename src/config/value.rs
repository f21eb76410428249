//! Config values and the settings tree.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// One configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Bool(bool),
    Integer(i64),
    Real(f64),
    Duration(Duration),
    String(String),
    Uri(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ConfigValue::Bool(_) => "bool",
            ConfigValue::Integer(_) => "integer",
            ConfigValue::Real(_) => "real",
            ConfigValue::Duration(_) => "duration",
            ConfigValue::String(_) => "string",
            ConfigValue::Uri(_) => "uri",
            ConfigValue::List(_) => "list",
            ConfigValue::Map(_) => "map",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ConfigValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Integers coerce to reals.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            ConfigValue::Real(x) => Some(*x),
            ConfigValue::Integer(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            ConfigValue::Duration(d) => Some(*d),
            _ => None,
        }
    }

    /// Strings and URIs render as `&str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::String(s) | ConfigValue::Uri(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{b}"),
            ConfigValue::Integer(n) => write!(f, "{n}"),
            ConfigValue::Real(x) => write!(f, "{x}"),
            ConfigValue::Duration(d) => write!(f, "{d:?}"),
            ConfigValue::String(s) => write!(f, "{s:?}"),
            ConfigValue::Uri(s) => write!(f, "<{s}>"),
            ConfigValue::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            ConfigValue::Map(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} = {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// Nested `category → name → value` mapping with dotted-path access.
/// Later `put`s override earlier ones, which gives the CLI-over-file
/// precedence for free.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    root: BTreeMap<String, ConfigValue>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Looks up a dotted path, descending through map values.
    pub fn get(&self, path: &str) -> Option<&ConfigValue> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.root.get(first)?;
        for segment in segments {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Stores a value under a dotted path, creating intermediate maps and
    /// replacing anything that stands in the way.
    pub fn put(&mut self, path: &str, value: ConfigValue) {
        let segments: Vec<&str> = path.split('.').collect();
        let mut map = &mut self.root;
        for segment in &segments[..segments.len() - 1] {
            let slot = map
                .entry((*segment).to_string())
                .or_insert_with(|| ConfigValue::Map(BTreeMap::new()));
            if !matches!(slot, ConfigValue::Map(_)) {
                *slot = ConfigValue::Map(BTreeMap::new());
            }
            map = match slot {
                ConfigValue::Map(inner) => inner,
                _ => unreachable!("slot was just normalized to a map"),
            };
        }
        if let Some(last) = segments.last() {
            map.insert((*last).to_string(), value);
        }
    }

    /// Applies every leaf of `other` on top of this tree.
    pub fn merge(&mut self, other: Settings) {
        fn apply(target: &mut Settings, prefix: &str, map: BTreeMap<String, ConfigValue>) {
            for (key, value) in map {
                let path = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                match value {
                    ConfigValue::Map(inner) => apply(target, &path, inner),
                    leaf => target.put(&path, leaf),
                }
            }
        }
        apply(self, "", other.root);
    }

    /// The names and values of one category, if present.
    pub fn category(&self, name: &str) -> Option<&BTreeMap<String, ConfigValue>> {
        self.root.get(name)?.as_map()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_puts_nest() {
        let mut settings = Settings::new();
        settings.put("a.b.c", ConfigValue::Integer(1));
        assert_eq!(settings.get("a.b.c"), Some(&ConfigValue::Integer(1)));
        assert!(settings.get("a.b.d").is_none());
        assert!(settings.category("a").is_some());
    }

    #[test]
    fn later_puts_override() {
        let mut settings = Settings::new();
        settings.put("x.y", ConfigValue::String("old".into()));
        settings.put("x.y", ConfigValue::String("new".into()));
        assert_eq!(
            settings.get("x.y").and_then(ConfigValue::as_str),
            Some("new")
        );
    }

    #[test]
    fn merge_overrides_leaves_only() {
        let mut base = Settings::new();
        base.put("a.keep", ConfigValue::Integer(1));
        base.put("a.swap", ConfigValue::Integer(2));
        let mut over = Settings::new();
        over.put("a.swap", ConfigValue::Integer(3));
        base.merge(over);
        assert_eq!(base.get("a.keep"), Some(&ConfigValue::Integer(1)));
        assert_eq!(base.get("a.swap"), Some(&ConfigValue::Integer(3)));
    }

    #[test]
    fn integers_coerce_to_reals() {
        assert_eq!(ConfigValue::Integer(4).as_real(), Some(4.0));
        assert_eq!(ConfigValue::Real(0.5).as_integer(), None);
    }
}
