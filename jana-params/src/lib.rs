//! Flat key/value parameter store.
//!
//! Every tunable in jana is a stringified parameter with a colon-separated,
//! case-insensitive name, e.g. `jana:event_pool_size`. Components declare
//! their parameters with [`ParameterManager::set_default`], which returns
//! the effective value: the user-supplied one if the parameter was set
//! before initialization, the default otherwise. After startup the store is
//! read-only in practice; unused user-set parameters usually indicate a
//! typo and can be listed with [`ParameterManager::unused`].

use std::collections::HashMap;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;

use jana_log::warn;

/// Error raised when a stored string cannot be converted to the requested
/// parameter type.
#[derive(Debug, thiserror::Error)]
#[error("cannot parse parameter '{name}': '{value}' is not a valid {type_name}")]
pub struct ParseError {
    /// Parameter name as originally registered.
    pub name: String,
    /// The offending stored string.
    pub value: String,
    /// Human-readable target type.
    pub type_name: &'static str,
}

/// Conversion between parameter strings and typed values.
///
/// This is deliberately narrower than `FromStr`/`Display`: booleans accept
/// the forms `0`, `1`, `true`, `false`, `on`, `off` in any case, matching
/// what operators put on command lines.
pub trait ParamValue: Sized {
    /// Type name used in parse error messages.
    const TYPE_NAME: &'static str;

    /// Parses the stored string.
    fn parse(s: &str) -> Option<Self>;

    /// Stringifies for storage.
    fn stringify(&self) -> String;
}

macro_rules! impl_param_value {
    ($($t:ty => $name:literal),* $(,)?) => {
        $(
            impl ParamValue for $t {
                const TYPE_NAME: &'static str = $name;

                fn parse(s: &str) -> Option<Self> {
                    <$t as FromStr>::from_str(s.trim()).ok()
                }

                fn stringify(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

impl_param_value! {
    u16 => "u16", u32 => "u32", u64 => "u64", usize => "usize",
    i16 => "i16", i32 => "i32", i64 => "i64", isize => "isize",
    f32 => "f32", f64 => "f64",
}

impl ParamValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => Some(true),
            "0" | "false" | "off" => Some(false),
            _ => None,
        }
    }

    fn stringify(&self) -> String {
        if *self { "1".into() } else { "0".into() }
    }
}

impl ParamValue for String {
    const TYPE_NAME: &'static str = "string";

    fn parse(s: &str) -> Option<Self> {
        Some(s.to_owned())
    }

    fn stringify(&self) -> String {
        self.clone()
    }
}

impl ParamValue for PathBuf {
    const TYPE_NAME: &'static str = "path";

    fn parse(s: &str) -> Option<Self> {
        Some(PathBuf::from(s))
    }

    fn stringify(&self) -> String {
        self.display().to_string()
    }
}

#[derive(Debug)]
struct Parameter {
    // Name with original casing, for display.
    name: String,
    value: String,
    default: Option<String>,
    description: Option<String>,
    is_used: bool,
}

/// The process-wide parameter store.
///
/// Lookups fold the name to lowercase; the original casing is preserved for
/// display. All methods take `&self` so the manager can be shared behind an
/// `Arc` between the builder, the engine, and user components.
#[derive(Debug, Default)]
pub struct ParameterManager {
    params: Mutex<HashMap<String, Parameter>>,
}

impl ParameterManager {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter, overwriting any previous value. Typically called
    /// while ingesting command-line flags, before components initialize.
    pub fn set<T: ParamValue>(&self, name: &str, value: T) {
        let key = name.to_ascii_lowercase();
        let mut params = self.params.lock().unwrap();
        let entry = params.entry(key).or_insert_with(|| Parameter {
            name: name.to_owned(),
            value: String::new(),
            default: None,
            description: None,
            is_used: false,
        });
        entry.value = value.stringify();
    }

    /// Declares a parameter with its default, returning the effective value.
    ///
    /// If the parameter was previously [`set`](Self::set), the stored string
    /// is parsed and returned; otherwise the default is stored and returned.
    /// A second registration with a different default keeps the first
    /// default and logs a warning, mirroring first-wins semantics.
    pub fn set_default<T: ParamValue + Display>(
        &self,
        name: &str,
        default: T,
        description: &str,
    ) -> Result<T, ParseError> {
        let key = name.to_ascii_lowercase();
        let mut params = self.params.lock().unwrap();
        match params.get_mut(&key) {
            Some(entry) => {
                if let Some(prev_default) = &entry.default {
                    if *prev_default != default.stringify() {
                        warn!(
                            "parameter '{}' declared with conflicting defaults '{}' and '{}'",
                            entry.name, prev_default, default
                        );
                    }
                } else {
                    entry.default = Some(default.stringify());
                }
                if entry.description.is_none() {
                    entry.description = Some(description.to_owned());
                }
                entry.is_used = true;
                T::parse(&entry.value).ok_or_else(|| ParseError {
                    name: entry.name.clone(),
                    value: entry.value.clone(),
                    type_name: T::TYPE_NAME,
                })
            }
            None => {
                params.insert(
                    key,
                    Parameter {
                        name: name.to_owned(),
                        value: default.stringify(),
                        default: Some(default.stringify()),
                        description: Some(description.to_owned()),
                        is_used: true,
                    },
                );
                Ok(default)
            }
        }
    }

    /// Reads a parameter without declaring a default. Returns `Ok(None)` if
    /// it was never set.
    pub fn get<T: ParamValue>(&self, name: &str) -> Result<Option<T>, ParseError> {
        let key = name.to_ascii_lowercase();
        let mut params = self.params.lock().unwrap();
        match params.get_mut(&key) {
            Some(entry) => {
                entry.is_used = true;
                T::parse(&entry.value)
                    .map(Some)
                    .ok_or_else(|| ParseError {
                        name: entry.name.clone(),
                        value: entry.value.clone(),
                        type_name: T::TYPE_NAME,
                    })
            }
            None => Ok(None),
        }
    }

    /// True if the parameter has been set or declared.
    pub fn exists(&self, name: &str) -> bool {
        self.params
            .lock()
            .unwrap()
            .contains_key(&name.to_ascii_lowercase())
    }

    /// True if the parameter still holds its declared default.
    pub fn is_default(&self, name: &str) -> bool {
        let params = self.params.lock().unwrap();
        match params.get(&name.to_ascii_lowercase()) {
            Some(entry) => entry.default.as_deref() == Some(entry.value.as_str()),
            None => false,
        }
    }

    /// Names of parameters that were set but never read by any component.
    pub fn unused(&self) -> Vec<String> {
        let params = self.params.lock().unwrap();
        let mut names: Vec<String> = params
            .values()
            .filter(|p| !p.is_used)
            .map(|p| p.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Logs a warning for every unused parameter. Called once at startup,
    /// after all components have had the chance to declare theirs.
    pub fn warn_on_unused(&self) {
        for name in self.unused() {
            warn!("parameter '{name}' was set but never used (typo?)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_when_unset() {
        let params = ParameterManager::new();
        let n = params.set_default("jana:timeout", 8u64, "").unwrap();
        assert_eq!(n, 8);
        assert!(params.is_default("jana:timeout"));
    }

    #[test]
    fn user_value_overrides_default() {
        let params = ParameterManager::new();
        params.set("JANA:TIMEOUT", 30u64);
        let n = params.set_default("jana:timeout", 8u64, "").unwrap();
        assert_eq!(n, 30);
        assert!(!params.is_default("jana:timeout"));
    }

    #[test]
    fn names_fold_case() {
        let params = ParameterManager::new();
        params.set("Jana:Event_Pool_Size", 16usize);
        assert!(params.exists("jana:event_pool_size"));
        assert_eq!(
            params.get::<usize>("JANA:EVENT_POOL_SIZE").unwrap(),
            Some(16)
        );
    }

    #[test]
    fn bool_forms() {
        let params = ParameterManager::new();
        for (form, expected) in [
            ("1", true),
            ("true", true),
            ("on", true),
            ("0", false),
            ("FALSE", false),
            ("off", false),
        ] {
            params.set("flag", form.to_owned());
            assert_eq!(params.get::<bool>("flag").unwrap(), Some(expected), "{form}");
        }
    }

    #[test]
    fn parse_failure_names_parameter() {
        let params = ParameterManager::new();
        params.set("nthreads", "lots".to_owned());
        let err = params.set_default("nthreads", 4usize, "").unwrap_err();
        assert!(err.to_string().contains("nthreads"));
        assert!(err.to_string().contains("lots"));
    }

    #[test]
    fn unused_reporting() {
        let params = ParameterManager::new();
        params.set("jana:tmieout", 5u64);
        params.set("jana:timeout", 5u64);
        params.set_default("jana:timeout", 8u64, "").unwrap();
        assert_eq!(params.unused(), vec!["jana:tmieout".to_owned()]);
    }
}
