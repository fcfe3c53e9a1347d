use serde::Deserialize;

/// One hit from `/search?format=json`. Coordinates arrive as decimal strings
/// and are kept that way.
#[derive(Debug, Clone, Deserialize)]
pub struct Place {
    pub lat: String,
    pub lon: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub importance: Option<f64>,
}

/// A geocoded location.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    pub latitude: String,
    pub longitude: String,
    pub address: Option<String>,
}

impl From<Place> for Location {
    fn from(p: Place) -> Self {
        Self {
            latitude: p.lat,
            longitude: p.lon,
            address: p.display_name,
        }
    }
}
