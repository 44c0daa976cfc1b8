use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::models::retrieval::{MediaItem, RetrievalHandle, RetrievalStatus, RetrievalUpdate};
use crate::services::rounds::RetrievalApi;
use crate::services::slug_bug::LocationLookup;

const DASHCAM_INPUT: &str = "dashcamRoadFacing";

/// Client for the Samsara fleet API.
pub struct SamsaraClient {
    http: Client,
    base_url: String,
    api_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRetrievalRequest<'a> {
    start_time: String,
    end_time: String,
    vehicle_id: &'a str,
    media_type: &'a str,
    inputs: [&'a str; 1],
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedRetrieval {
    retrieval_id: String,
}

#[derive(Deserialize)]
struct RetrievalData {
    #[serde(default)]
    media: Vec<RetrievalMedia>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrievalMedia {
    status: String,
    #[serde(default)]
    input: String,
    #[serde(default)]
    media_type: String,
    url_info: Option<UrlInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UrlInfo {
    url: String,
    url_expiry_time: Option<String>,
}

#[derive(Deserialize)]
struct VehicleLocation {
    location: Option<Location>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Location {
    reverse_geo: Option<ReverseGeo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReverseGeo {
    formatted_location: Option<String>,
}

impl SamsaraClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    async fn check(response: Response) -> Result<Response, SamsaraError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SamsaraError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Reverse-geocoded address of a vehicle at `time` (epoch ms), if Samsara has one.
    pub async fn vehicle_location(
        &self,
        asset_id: &str,
        time: i64,
    ) -> Result<Option<String>, SamsaraError> {
        let response = self
            .http
            .get(format!("{}/fleet/vehicles/locations", self.base_url))
            .bearer_auth(&self.api_key)
            .header("accept", "application/json")
            .query(&[("time", rfc3339(time)?.as_str()), ("vehicleIds", asset_id)])
            .send()
            .await?;

        let body: Envelope<Vec<VehicleLocation>> = Self::check(response).await?.json().await?;
        Ok(body
            .data
            .into_iter()
            .next()
            .and_then(|v| v.location)
            .and_then(|l| l.reverse_geo)
            .and_then(|g| g.formatted_location))
    }
}

#[async_trait]
impl RetrievalApi for SamsaraClient {
    async fn create_retrieval(
        &self,
        asset_id: &str,
        capture_time: i64,
    ) -> Result<RetrievalHandle, SamsaraError> {
        let at = rfc3339(capture_time)?;
        let request = CreateRetrievalRequest {
            start_time: at.clone(),
            end_time: at,
            vehicle_id: asset_id,
            media_type: "image",
            inputs: [DASHCAM_INPUT],
        };

        let response = self
            .http
            .post(format!("{}/cameras/media/retrieval", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let body: Envelope<CreatedRetrieval> = Self::check(response).await?.json().await?;
        Ok(RetrievalHandle::new(body.data.retrieval_id, asset_id, capture_time))
    }

    async fn get_retrieval(&self, retrieval_id: &str) -> Result<RetrievalUpdate, SamsaraError> {
        let response = self
            .http
            .get(format!("{}/cameras/media/retrieval", self.base_url))
            .bearer_auth(&self.api_key)
            .query(&[("retrievalId", retrieval_id)])
            .send()
            .await?;

        let body: Envelope<RetrievalData> = Self::check(response).await?.json().await?;
        Ok(to_update(body.data))
    }
}

#[async_trait]
impl LocationLookup for SamsaraClient {
    async fn location_at(&self, asset_id: &str, time: i64) -> Result<Option<String>, SamsaraError> {
        self.vehicle_location(asset_id, time).await
    }
}

fn to_update(data: RetrievalData) -> RetrievalUpdate {
    let media: Vec<MediaItem> = data
        .media
        .into_iter()
        .map(|m| MediaItem {
            status: RetrievalStatus::from_external(&m.status),
            input: m.input,
            media_type: m.media_type,
            url: m.url_info.as_ref().map(|u| u.url.clone()),
            url_expiry_time: m.url_info.and_then(|u| u.url_expiry_time),
        })
        .collect();

    // An empty media list means Samsara has not reported anything yet.
    if media.is_empty() {
        return RetrievalUpdate::default();
    }

    RetrievalUpdate {
        status: Some(RetrievalStatus::aggregate(media.iter().map(|m| m.status))),
        media: Some(media),
    }
}

/// Epoch milliseconds as an RFC 3339 UTC timestamp.
fn rfc3339(millis: i64) -> Result<String, SamsaraError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or(SamsaraError::InvalidTimestamp(millis))
}

#[derive(Debug, thiserror::Error)]
pub enum SamsaraError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Samsara API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}
