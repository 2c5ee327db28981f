use std::time::Duration;
use tracing::warn;

/// Timing knobs for the sync layer, read from `TSISKARI_*` variables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub cache_ttl: Duration,
    pub cache_max_entries: Option<u64>,
    pub dedupe_grace: Duration,
    pub check_timeout: Duration,
    pub check_interval: Duration,
    pub check_initial_delay: Duration,
    pub debounce_window: Duration,
    pub defer_delay: Duration,
    pub reload_cooldown: Duration,
    pub data_dir: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_millis(Self::DEFAULT_CACHE_TTL_MS),
            cache_max_entries: None,
            dedupe_grace: Duration::from_millis(Self::DEFAULT_DEDUPE_GRACE_MS),
            check_timeout: Duration::from_millis(Self::DEFAULT_CHECK_TIMEOUT_MS),
            check_interval: Duration::from_millis(Self::DEFAULT_CHECK_INTERVAL_MS),
            check_initial_delay: Duration::from_millis(Self::DEFAULT_CHECK_INITIAL_DELAY_MS),
            debounce_window: Duration::from_millis(Self::DEFAULT_DEBOUNCE_MS),
            defer_delay: Duration::from_millis(Self::DEFAULT_DEFER_MS),
            reload_cooldown: Duration::from_millis(Self::DEFAULT_RELOAD_COOLDOWN_MS),
            data_dir: Self::DEFAULT_DATA_DIR.to_string(),
        }
    }
}

impl SyncConfig {
    const DEFAULT_CACHE_TTL_MS: u64 = 30_000;
    const DEFAULT_DEDUPE_GRACE_MS: u64 = 2_000;
    const DEFAULT_CHECK_TIMEOUT_MS: u64 = 5_000;
    const DEFAULT_CHECK_INTERVAL_MS: u64 = 5 * 60 * 1_000;
    const DEFAULT_CHECK_INITIAL_DELAY_MS: u64 = 1_500;
    const DEFAULT_DEBOUNCE_MS: u64 = 300;
    const DEFAULT_DEFER_MS: u64 = 2_000;
    const DEFAULT_RELOAD_COOLDOWN_MS: u64 = 10_000;
    const DEFAULT_DATA_DIR: &str = "./data";

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from any variable source. Unparseable values fall
    /// back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |name: &str, default: u64| -> Duration {
            Duration::from_millis(parse_or(name, lookup(name), default))
        };

        Self {
            cache_ttl: millis("TSISKARI_CACHE_TTL_MS", Self::DEFAULT_CACHE_TTL_MS),
            cache_max_entries: lookup("TSISKARI_CACHE_MAX_ENTRIES").and_then(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| warn!("TSISKARI_CACHE_MAX_ENTRIES={raw:?} is not a number, leaving cache unbounded"))
                    .ok()
            }),
            dedupe_grace: millis("TSISKARI_DEDUPE_GRACE_MS", Self::DEFAULT_DEDUPE_GRACE_MS),
            check_timeout: millis("TSISKARI_CHECK_TIMEOUT_MS", Self::DEFAULT_CHECK_TIMEOUT_MS),
            check_interval: millis("TSISKARI_CHECK_INTERVAL_MS", Self::DEFAULT_CHECK_INTERVAL_MS),
            check_initial_delay: millis(
                "TSISKARI_CHECK_INITIAL_DELAY_MS",
                Self::DEFAULT_CHECK_INITIAL_DELAY_MS,
            ),
            debounce_window: millis("TSISKARI_DEBOUNCE_MS", Self::DEFAULT_DEBOUNCE_MS),
            defer_delay: millis("TSISKARI_DEFER_MS", Self::DEFAULT_DEFER_MS),
            reload_cooldown: millis("TSISKARI_RELOAD_COOLDOWN_MS", Self::DEFAULT_RELOAD_COOLDOWN_MS),
            data_dir: lookup("TSISKARI_DATA_DIR").unwrap_or_else(|| Self::DEFAULT_DATA_DIR.to_string()),
        }
    }
}

fn parse_or(name: &str, raw: Option<String>, default: u64) -> u64 {
    match raw {
        None => default,
        Some(raw) => raw.trim().parse::<u64>().unwrap_or_else(|_| {
            warn!("{name}={raw:?} is not a number of milliseconds, using default {default}");
            default
        }),
    }
}
