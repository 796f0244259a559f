// THEORY:
// Weather is context, not measurement: the dashboard shows it next to the camera's
// own visibility score so an operator can tell fog from a dirty lens. Because it
// is only context, it must never fail. `WeatherService::get_weather` always
// returns a complete `WeatherReport`:
//
// 1.  fresh cached report, if the location was fetched within its refresh interval;
// 2.  otherwise a live lookup through the primary `WeatherProvider` (OpenWeatherMap);
// 3.  on lookup failure, the last good report for the location, however old;
// 4.  otherwise a synthetic report, flagged `synthetic: true`.
//
// A missing or malformed API key skips step 2 entirely. The synthetic generator
// is a seedable `StdRng` behind the same `WeatherProvider` trait, so tests can pin
// its output.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::WeatherSettings;
use crate::error::Result;

pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const SYNTHETIC_ICON: &str = "https://openweathermap.org/img/wn/02d@2x.png";
const SYNTHETIC_CONDITIONS: [&str; 6] = ["Clear", "Partly Cloudy", "Cloudy", "Light Rain", "Heavy Rain", "Foggy"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub location: String,
    pub temperature_c: f64,
    pub humidity_pct: f64,
    pub wind_speed_ms: f64,
    pub visibility_km: f64,
    pub condition: String,
    pub icon_url: String,
    pub last_updated: DateTime<Utc>,
    pub synthetic: bool,
}

pub trait WeatherProvider: Send + Sync {
    fn lookup(&self, location: &str) -> impl Future<Output = Result<WeatherReport>> + Send;
}

/// Keys shorter than 16 characters or with non-alphanumeric characters are
/// treated as placeholders.
pub fn is_valid_api_key(key: &str) -> bool {
    let key = key.trim();
    key.len() >= 16 && key.chars().all(|c| c.is_ascii_alphanumeric())
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: f64,
    humidity: f64,
}

#[derive(Debug, Default, Deserialize)]
struct OwmWind {
    #[serde(default)]
    speed: f64,
}

#[derive(Debug, Deserialize)]
struct OwmCondition {
    description: String,
    icon: String,
}

#[derive(Debug, Deserialize)]
struct OwmResponse {
    main: OwmMain,
    #[serde(default)]
    wind: OwmWind,
    /// Metres; the API caps it at 10 km.
    visibility: Option<f64>,
    #[serde(default)]
    weather: Vec<OwmCondition>,
}

/// OpenWeatherMap current-weather lookup.
pub struct OpenWeatherClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenWeatherClient {
    /// `None` when the key is missing or malformed.
    pub fn new(api_key: Option<&str>, base_url: &str) -> Option<Self> {
        let api_key = api_key.filter(|k| is_valid_api_key(k))?;
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build().ok()?;
        Some(OpenWeatherClient { client, api_key: api_key.trim().to_string(), base_url: base_url.to_string() })
    }
}

impl WeatherProvider for OpenWeatherClient {
    async fn lookup(&self, location: &str) -> Result<WeatherReport> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[("q", location), ("appid", self.api_key.as_str()), ("units", "metric")])
            .send()
            .await?
            .error_for_status()?
            .json::<OwmResponse>()
            .await?;

        let condition = response.weather.first();
        Ok(WeatherReport {
            location: location.to_string(),
            temperature_c: response.main.temp,
            humidity_pct: response.main.humidity,
            wind_speed_ms: response.wind.speed,
            visibility_km: response.visibility.unwrap_or(10_000.0) / 1_000.0,
            condition: condition.map(|c| capitalize(&c.description)).unwrap_or_else(|| "Unknown".into()),
            icon_url: condition
                .map(|c| format!("https://openweathermap.org/img/wn/{}@2x.png", c.icon))
                .unwrap_or_else(|| SYNTHETIC_ICON.to_string()),
            last_updated: Utc::now(),
            synthetic: false,
        })
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Plausible mid-latitude weather from a seedable generator.
pub struct SyntheticWeather {
    rng: Mutex<StdRng>,
}

impl SyntheticWeather {
    pub fn seeded(seed: u64) -> Self {
        SyntheticWeather { rng: Mutex::new(StdRng::seed_from_u64(seed)) }
    }

    pub fn from_os_rng() -> Self {
        SyntheticWeather { rng: Mutex::new(StdRng::from_os_rng()) }
    }

    pub fn generate(&self, location: &str) -> WeatherReport {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let round1 = |v: f64| (v * 10.0).round() / 10.0;
        let condition = SYNTHETIC_CONDITIONS.choose(&mut *rng).copied().unwrap_or("Clear");
        WeatherReport {
            location: location.to_string(),
            temperature_c: round1(22.5 + rng.random_range(-5.0..=5.0)),
            humidity_pct: round1((65.0 + rng.random_range(-10.0..=10.0_f64)).clamp(0.0, 100.0)),
            wind_speed_ms: round1((10.2 + rng.random_range(-5.0..=5.0_f64)).max(0.0)),
            visibility_km: round1((8.5 + rng.random_range(-3.0..=3.0_f64)).max(0.1)),
            condition: condition.to_string(),
            icon_url: SYNTHETIC_ICON.to_string(),
            last_updated: Utc::now(),
            synthetic: true,
        }
    }
}

impl WeatherProvider for SyntheticWeather {
    async fn lookup(&self, location: &str) -> Result<WeatherReport> {
        Ok(self.generate(location))
    }
}

struct Cached {
    report: WeatherReport,
    fetched: Instant,
}

/// Cached, never-failing weather lookups.
pub struct WeatherService<P = OpenWeatherClient> {
    primary: Option<P>,
    synthetic: SyntheticWeather,
    default_refresh: Duration,
    refresh_overrides: Mutex<HashMap<String, Duration>>,
    cache: Mutex<HashMap<String, Cached>>,
}

impl WeatherService<OpenWeatherClient> {
    pub fn from_settings(settings: &WeatherSettings) -> Self {
        let primary = OpenWeatherClient::new(settings.api_key.as_deref(), &settings.base_url);
        if primary.is_none() {
            info!("no valid weather API key, using synthetic weather");
        }
        let synthetic = match settings.synthetic_seed {
            Some(seed) => SyntheticWeather::seeded(seed),
            None => SyntheticWeather::from_os_rng(),
        };
        let refresh = Duration::from_secs(settings.refresh_interval_minutes * 60).max(MIN_REFRESH_INTERVAL);
        WeatherService::with_provider(primary, synthetic, refresh)
    }
}

impl<P: WeatherProvider> WeatherService<P> {
    pub fn with_provider(primary: Option<P>, synthetic: SyntheticWeather, default_refresh: Duration) -> Self {
        WeatherService {
            primary,
            synthetic,
            default_refresh,
            refresh_overrides: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_live_provider(&self) -> bool {
        self.primary.is_some()
    }

    /// Per-location refresh interval, never below five minutes.
    pub fn set_refresh_interval(&self, location: &str, minutes: u64) -> Duration {
        let interval = Duration::from_secs(minutes * 60);
        let interval = if interval < MIN_REFRESH_INTERVAL {
            warn!(location, minutes, "weather refresh interval raised to the 5 minute minimum");
            MIN_REFRESH_INTERVAL
        } else {
            interval
        };
        self.refresh_overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key(location), interval);
        interval
    }

    fn refresh_for(&self, key: &str) -> Duration {
        self.refresh_overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(self.default_refresh)
    }

    pub async fn get_weather(&self, location: &str) -> WeatherReport {
        let key = cache_key(location);
        let Some(primary) = &self.primary else {
            return self.synthetic.generate(location);
        };

        let refresh = self.refresh_for(&key);
        let fresh = self
            .cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .filter(|c| c.fetched.elapsed() < refresh)
            .map(|c| c.report.clone());
        if let Some(report) = fresh {
            debug!(location, "weather served from cache");
            return report;
        }

        match primary.lookup(location).await {
            Ok(report) => {
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, Cached { report: report.clone(), fetched: Instant::now() });
                report
            }
            Err(e) => {
                let stale = self
                    .cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&key)
                    .map(|c| c.report.clone());
                match stale {
                    Some(report) => {
                        warn!(location, "weather lookup failed, serving stale report: {e}");
                        report
                    }
                    None => {
                        warn!(location, "weather lookup failed, using synthetic report: {e}");
                        self.synthetic.generate(location)
                    }
                }
            }
        }
    }
}

fn cache_key(location: &str) -> String {
    location.trim().to_lowercase()
}

/// One-shot lookup with default settings and an optional API key.
pub async fn get_weather(location: &str, api_key: Option<&str>) -> WeatherReport {
    let settings = WeatherSettings { api_key: api_key.map(str::to_string), ..WeatherSettings::default() };
    WeatherService::from_settings(&settings).get_weather(location).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn real_report(location: &str, temperature_c: f64) -> WeatherReport {
        WeatherReport {
            location: location.into(),
            temperature_c,
            humidity_pct: 80.0,
            wind_speed_ms: 3.0,
            visibility_km: 0.4,
            condition: "Mist".into(),
            icon_url: "https://openweathermap.org/img/wn/50d@2x.png".into(),
            last_updated: Utc::now(),
            synthetic: false,
        }
    }

    /// Succeeds for the first `successes` calls, then fails.
    struct Flaky {
        calls: AtomicUsize,
        successes: usize,
    }

    impl WeatherProvider for Flaky {
        async fn lookup(&self, location: &str) -> Result<WeatherReport> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.successes {
                Ok(real_report(location, 10.0 + call as f64))
            } else {
                Err(Error::WeatherLookup("HTTP 503".into()))
            }
        }
    }

    fn complete(report: &WeatherReport) -> bool {
        report.temperature_c.is_finite()
            && (0.0..=100.0).contains(&report.humidity_pct)
            && report.wind_speed_ms >= 0.0
            && report.visibility_km > 0.0
            && !report.condition.is_empty()
            && report.icon_url.starts_with("https://")
    }

    #[tokio::test]
    async fn invalid_key_yields_synthetic_report() {
        let report = get_weather("Reykjavik", Some("not-a-key")).await;
        assert!(report.synthetic);
        assert!(complete(&report));
        assert_eq!(report.location, "Reykjavik");
        assert!(SYNTHETIC_CONDITIONS.contains(&report.condition.as_str()));
    }

    #[test]
    fn key_validation() {
        assert!(!is_valid_api_key(""));
        assert!(!is_valid_api_key("your_api_key_here"));
        assert!(is_valid_api_key("0123456789abcdef0123456789abcdef"));
    }

    #[test]
    fn seeded_synthetic_is_reproducible() {
        let a = SyntheticWeather::seeded(42).generate("Oslo");
        let b = SyntheticWeather::seeded(42).generate("Oslo");
        assert_eq!(a.temperature_c, b.temperature_c);
        assert_eq!(a.condition, b.condition);
        assert!((17.5..=27.5).contains(&a.temperature_c));
        assert!((5.5..=11.5).contains(&a.visibility_km));
    }

    #[tokio::test]
    async fn fresh_cache_avoids_lookup() {
        let service = WeatherService::with_provider(
            Some(Flaky { calls: AtomicUsize::new(0), successes: 10 }),
            SyntheticWeather::seeded(1),
            Duration::from_secs(600),
        );
        let first = service.get_weather("Bergen").await;
        let second = service.get_weather("bergen ").await;
        assert_eq!(first, second);
        assert_eq!(service.primary.as_ref().unwrap().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_serves_stale_then_synthetic() {
        let service = WeatherService::with_provider(
            Some(Flaky { calls: AtomicUsize::new(0), successes: 1 }),
            SyntheticWeather::seeded(7),
            Duration::ZERO,
        );
        let live = service.get_weather("Tromso").await;
        assert!(!live.synthetic);

        let stale = service.get_weather("Tromso").await;
        assert_eq!(stale, live);

        let other = service.get_weather("Narvik").await;
        assert!(other.synthetic);
        assert!(complete(&other));
    }

    #[test]
    fn refresh_interval_has_a_floor() {
        let service: WeatherService<SyntheticWeather> =
            WeatherService::with_provider(None, SyntheticWeather::seeded(3), Duration::from_secs(1_800));
        assert_eq!(service.set_refresh_interval("Bodo", 1), MIN_REFRESH_INTERVAL);
        assert_eq!(service.set_refresh_interval("Bodo", 45), Duration::from_secs(45 * 60));
    }
}
