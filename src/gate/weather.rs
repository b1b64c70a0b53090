use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::LinkError;
use crate::models::weather::{Visibility, WeatherConditions};

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn conditions(&self, lat: f64, lng: f64) -> Result<WeatherConditions, LinkError>;
}

/// Fixed conditions, switchable at runtime. `None` makes every lookup fail.
pub struct StaticWeather {
    current: RwLock<Option<WeatherConditions>>,
}

impl StaticWeather {
    pub fn new(conditions: WeatherConditions) -> Self {
        Self {
            current: RwLock::new(Some(conditions)),
        }
    }

    pub fn calm() -> Self {
        Self::new(WeatherConditions::calm())
    }

    pub fn unavailable() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    pub fn set(&self, conditions: Option<WeatherConditions>) {
        if let Ok(mut current) = self.current.write() {
            *current = conditions;
        }
    }
}

#[async_trait]
impl WeatherProvider for StaticWeather {
    async fn conditions(&self, _lat: f64, _lng: f64) -> Result<WeatherConditions, LinkError> {
        let current = self
            .current
            .read()
            .map_err(|_| LinkError::Transport("weather lock poisoned".to_string()))?;
        current.ok_or_else(|| LinkError::Transport("weather provider unavailable".to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WeatherResponse {
    wind_speed: f64,
    #[serde(default)]
    precipitation: f64,
    #[serde(default)]
    visibility: Option<Visibility>,
    #[serde(default)]
    temperature: Option<f64>,
}

pub struct HttpWeatherProvider {
    base_url: String,
    client: Client,
    timeout: Duration,
}

impl HttpWeatherProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl WeatherProvider for HttpWeatherProvider {
    async fn conditions(&self, lat: f64, lng: f64) -> Result<WeatherConditions, LinkError> {
        let response = self
            .client
            .get(format!("{}/conditions", self.base_url))
            .query(&[("lat", lat), ("lng", lng)])
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| LinkError::Transport(format!("weather request failed: {err}")))?;

        if !response.status().is_success() {
            return Err(LinkError::Transport(format!(
                "weather provider returned {}",
                response.status()
            )));
        }

        let payload: WeatherResponse = response
            .json()
            .await
            .map_err(|err| LinkError::Malformed(format!("weather payload: {err}")))?;

        let calm = WeatherConditions::calm();
        Ok(WeatherConditions {
            wind_speed: payload.wind_speed,
            precipitation: payload.precipitation,
            visibility: payload.visibility.unwrap_or(calm.visibility),
            temperature: payload.temperature.unwrap_or(calm.temperature),
        })
    }
}
