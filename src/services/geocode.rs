use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

/// Address components returned by the reverse geocoder.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Address {
    pub house_number: Option<String>,
    pub road: Option<String>,
    pub suburb: Option<String>,
    pub city: Option<String>,
    pub town: Option<String>,
    pub village: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
}

impl Address {
    /// Single-line postal form, e.g. "12 Main Street, Springfield, IL 62701".
    pub fn formatted(&self) -> Option<String> {
        let street = match (&self.house_number, &self.road) {
            (Some(number), Some(road)) => Some(format!("{number} {road}")),
            (None, Some(road)) => Some(road.clone()),
            _ => None,
        };
        let locality = self
            .city
            .clone()
            .or_else(|| self.town.clone())
            .or_else(|| self.village.clone())
            .or_else(|| self.suburb.clone());
        let region = match (&self.state, &self.postcode) {
            (Some(state), Some(postcode)) => Some(format!("{state} {postcode}")),
            (Some(state), None) => Some(state.clone()),
            (None, Some(postcode)) => Some(postcode.clone()),
            (None, None) => None,
        };

        let parts: Vec<String> = [street, locality, region].into_iter().flatten().collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(", "))
        }
    }
}

#[derive(Deserialize)]
struct ReverseResponse {
    #[serde(default)]
    address: Option<Address>,
    #[serde(default)]
    display_name: Option<String>,
}

/// Client for a Nominatim-compatible reverse geocoding endpoint.
pub struct ReverseGeocoder {
    http: Client,
    base_url: String,
    attempts: u32,
    retry_delay: Duration,
}

impl ReverseGeocoder {
    pub fn new(base_url: &str, attempts: u32, retry_delay: Duration) -> Result<Self, GeocodeError> {
        let http = Client::builder()
            .user_agent(concat!("fieldsync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            attempts: attempts.max(1),
            retry_delay,
        })
    }

    /// One lookup attempt.
    pub async fn lookup(&self, latitude: f64, longitude: f64) -> Result<String, GeocodeError> {
        let url = format!("{}/reverse", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("format", "jsonv2".to_string()),
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }

        let body: ReverseResponse = response.json().await?;
        body.address
            .and_then(|a| a.formatted())
            .or(body.display_name)
            .ok_or(GeocodeError::NoAddress)
    }

    /// Lookup with a fixed delay between attempts. `None` once every attempt failed.
    pub async fn lookup_with_retry(&self, latitude: f64, longitude: f64) -> Option<String> {
        for attempt in 1..=self.attempts {
            match self.lookup(latitude, longitude).await {
                Ok(address) => return Some(address),
                Err(e) => {
                    tracing::warn!(attempt, max_attempts = self.attempts, error = %e, "Reverse geocoding failed");
                    if attempt < self.attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }
        None
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Geocoder returned HTTP {0}")]
    Status(u16),

    #[error("Geocoder returned no address")]
    NoAddress,
}
