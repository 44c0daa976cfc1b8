use garde::Validate;
use serde::{Deserialize, Deserializer, Serialize};

/// Alert payload delivered by the Samsara function trigger.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    #[garde(length(min = 1, max = 64), alphanumeric)]
    pub asset_id: String,

    /// Epoch milliseconds. Samsara sends it as a string.
    #[serde(deserialize_with = "millis_from_string_or_number")]
    #[garde(range(min = 0))]
    pub alert_incident_time: i64,

    #[serde(default)]
    #[garde(skip)]
    pub alert_configuration_id: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub driver_id: Option<String>,
}

/// Response after an alert started (or found) a round.
#[derive(Debug, Serialize)]
pub struct BeginRoundResponse {
    pub round_key: String,
    pub created: bool,
    pub status: String,
    pub capture_times: Vec<i64>,
}

fn millis_from_string_or_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Millis {
        Number(i64),
        Text(String),
    }

    match Millis::deserialize(deserializer)? {
        Millis::Number(n) => Ok(n),
        Millis::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
