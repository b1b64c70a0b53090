use serde::{Deserialize, Serialize};

pub const MAX_WIND_SPEED_KMH: f64 = 15.0;
pub const MAX_PRECIPITATION_MM_H: f64 = 0.1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Excellent,
    Good,
    Moderate,
    Poor,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeatherConditions {
    pub wind_speed: f64,
    pub precipitation: f64,
    pub visibility: Visibility,
    pub temperature: f64,
}

impl WeatherConditions {
    pub fn calm() -> Self {
        Self {
            wind_speed: 0.0,
            precipitation: 0.0,
            visibility: Visibility::Excellent,
            temperature: 20.0,
        }
    }

    /// Returns the first threshold the conditions exceed, if any.
    pub fn unsafe_reason(&self) -> Option<String> {
        if self.wind_speed > MAX_WIND_SPEED_KMH {
            return Some(format!(
                "wind speed {:.1} km/h exceeds {MAX_WIND_SPEED_KMH} km/h",
                self.wind_speed
            ));
        }
        if self.precipitation > MAX_PRECIPITATION_MM_H {
            return Some(format!(
                "precipitation {:.2} mm/h exceeds {MAX_PRECIPITATION_MM_H} mm/h",
                self.precipitation
            ));
        }
        if self.visibility == Visibility::Poor {
            return Some("visibility is poor".to_string());
        }
        None
    }
}

impl Default for WeatherConditions {
    fn default() -> Self {
        Self::calm()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_are_exclusive() {
        let mut weather = WeatherConditions::calm();
        weather.wind_speed = 15.0;
        weather.precipitation = 0.1;
        assert_eq!(weather.unsafe_reason(), None);

        weather.wind_speed = 15.1;
        assert!(weather.unsafe_reason().unwrap().contains("wind"));
    }

    #[test]
    fn poor_visibility_is_unsafe() {
        let weather = WeatherConditions {
            visibility: Visibility::Poor,
            ..WeatherConditions::calm()
        };
        assert_eq!(weather.unsafe_reason().as_deref(), Some("visibility is poor"));
    }
}
