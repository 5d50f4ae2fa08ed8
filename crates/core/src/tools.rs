//! Built-in Capabilities
//!
//! An MCP tool server exposing the capabilities the backend may ask the client
//! to run: weather lookup, geocoding and news retrieval. Weather and geocoding
//! go to Open-Meteo; news goes through a proxy hosted by the backend.

use rmcp::{
    ServerHandler,
    handler::server::{router::tool::ToolRouter, tool::Parameters},
    model::{ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

const OPEN_METEO_GEOCODING_URL: &str = "https://geocoding-api.open-meteo.com/v1/search";
const OPEN_METEO_FORECAST_URL: &str = "https://api.open-meteo.com/v1/forecast";

/// Where each capability sends its requests.
#[derive(Debug, Clone)]
pub struct CapabilityEndpoints {
    pub geocoding_url: String,
    pub forecast_url: String,
    /// `<backend>/v1/news`; news lookups fail when the backend is unknown.
    pub news_url: Option<String>,
}

impl CapabilityEndpoints {
    /// Public Open-Meteo endpoints, with news proxied through `backend_url`.
    pub fn open_meteo(backend_url: Option<&str>) -> Self {
        Self {
            geocoding_url: OPEN_METEO_GEOCODING_URL.to_string(),
            forecast_url: OPEN_METEO_FORECAST_URL.to_string(),
            news_url: backend_url.map(|url| format!("{}/v1/news", url.trim_end_matches('/'))),
        }
    }
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct GeocodeArgs {
    /// Free-form place name, e.g. "Paris" or "Lyon, France".
    pub query: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct WeatherArgs {
    /// Place name to report the current weather for.
    pub location: String,
}

#[derive(Deserialize, JsonSchema, Debug)]
pub struct NewsArgs {
    /// Subject to search headlines for.
    pub topic: String,
}

/// A resolved place.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Place {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<Place>,
}

#[derive(Deserialize)]
struct ForecastResponse {
    current_weather: CurrentWeather,
}

#[derive(Serialize, Deserialize)]
struct CurrentWeather {
    temperature: f64,
    windspeed: f64,
    weathercode: i64,
}

/// The MCP server behind the client's tool calls.
pub struct CapabilityService {
    http: reqwest::Client,
    endpoints: CapabilityEndpoints,
    tool_router: ToolRouter<Self>,
}

#[tool_handler]
impl ServerHandler for CapabilityService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

#[tool_router]
impl CapabilityService {
    pub fn new(http: reqwest::Client, endpoints: CapabilityEndpoints) -> Self {
        Self {
            http,
            endpoints,
            tool_router: Self::tool_router(),
        }
    }

    #[tool(description = "Find the coordinates of a place by name.")]
    pub async fn geocode(&self, args: Parameters<GeocodeArgs>) -> Result<String, String> {
        info!(query = %args.0.query, "Executing tool 'geocode'");
        let place = self.lookup(&args.0.query).await?;
        serde_json::to_string(&place).map_err(|e| format!("Failed to serialize place: {e}"))
    }

    #[tool(description = "Get the current weather for a place, given its name.")]
    pub async fn get_weather(&self, args: Parameters<WeatherArgs>) -> Result<String, String> {
        info!(location = %args.0.location, "Executing tool 'get_weather'");
        let place = self.lookup(&args.0.location).await?;
        let forecast: ForecastResponse = self
            .http
            .get(&self.endpoints.forecast_url)
            .query(&[
                ("latitude", place.latitude.to_string()),
                ("longitude", place.longitude.to_string()),
                ("current_weather", "true".to_string()),
            ])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("Weather lookup failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Weather response was malformed: {e}"))?;

        let report = serde_json::json!({
            "location": place.name,
            "country": place.country,
            "temperature_celsius": forecast.current_weather.temperature,
            "windspeed_kmh": forecast.current_weather.windspeed,
            "weathercode": forecast.current_weather.weathercode,
        });
        Ok(report.to_string())
    }

    #[tool(description = "Get recent news headlines about a topic.")]
    pub async fn get_news(&self, args: Parameters<NewsArgs>) -> Result<String, String> {
        info!(topic = %args.0.topic, "Executing tool 'get_news'");
        let url = self
            .endpoints
            .news_url
            .as_ref()
            .ok_or_else(|| "News is unavailable: no backend configured".to_string())?;
        self.http
            .get(url)
            .query(&[("q", args.0.topic.as_str())])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("News lookup failed: {e}"))?
            .text()
            .await
            .map_err(|e| format!("News response was unreadable: {e}"))
    }
}

impl CapabilityService {
    async fn lookup(&self, query: &str) -> Result<Place, String> {
        let response: GeocodingResponse = self
            .http
            .get(&self.endpoints.geocoding_url)
            .query(&[("name", query), ("count", "1")])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("Geocoding failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("Geocoding response was malformed: {e}"))?;
        response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| format!("No place found for '{query}'"))
    }
}
