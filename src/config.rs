//! Environment-driven switches, read once per process

use std::sync::OnceLock;

pub const ENV_USE_DICT_MEMO: &str = "GRAPHCOPY_USE_DICT_MEMO";
pub const ENV_NO_MEMO_FALLBACK: &str = "GRAPHCOPY_NO_MEMO_FALLBACK";
pub const ENV_NO_MEMO_FALLBACK_WARNING: &str = "GRAPHCOPY_NO_MEMO_FALLBACK_WARNING";

/// Which memo-rejection warnings are silenced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum WarningFilter {
    #[default]
    None,
    All,
    /// `"TypeError: message"` identifiers, matched as suffixes.
    Matching(Vec<String>),
}

impl WarningFilter {
    fn parse(raw: &str) -> Self {
        if is_truthy(raw) {
            return WarningFilter::All;
        }
        let entries: Vec<String> = raw
            .split("::")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        if entries.is_empty() {
            WarningFilter::None
        } else {
            WarningFilter::Matching(entries)
        }
    }

    pub fn silences(&self, error_identifier: &str) -> bool {
        match self {
            WarningFilter::None => false,
            WarningFilter::All => true,
            WarningFilter::Matching(entries) => entries
                .iter()
                .any(|entry| error_identifier.ends_with(entry.as_str())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Use a fresh plain dict per top-level call instead of the pooled native memo.
    pub use_dict_memo: bool,
    /// Retry `__deepcopy__` hooks that reject the native memo with a dict.
    pub memo_fallback: bool,
    pub fallback_warning: WarningFilter,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Process-wide configuration (first call reads the environment).
pub fn get() -> &'static Config {
    CONFIG.get_or_init(|| Config::from_lookup(|name| std::env::var(name).ok()))
}

impl Config {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |name: &str| lookup(name).is_some_and(|raw| is_truthy(&raw));
        let fallback_warning = match lookup(ENV_NO_MEMO_FALLBACK_WARNING) {
            Some(raw) => WarningFilter::parse(&raw),
            None => WarningFilter::None,
        };
        let config = Config {
            use_dict_memo: flag(ENV_USE_DICT_MEMO),
            memo_fallback: !flag(ENV_NO_MEMO_FALLBACK),
            fallback_warning,
        };
        log::debug!("graphcopy config: {config:?}");
        config
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
