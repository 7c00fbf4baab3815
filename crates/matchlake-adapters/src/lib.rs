//! Activity source contracts and the Riot account/match-v5 client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, NaiveTime};
use matchlake_core::ActivityRecord;
use matchlake_storage::{
    BackoffPolicy, FetchError, FetchedResponse, HttpFetcher, RawPayloadArchive,
};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Url;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub mod normalize;
pub mod schema;

pub use normalize::{coerce_to_f64, NormalizeError, RowNormalizer};
pub use schema::riot_match_table_schema;

pub const RIOT_SOURCE_ID: &str = "riot-match-v5";

const RIOT_TOKEN_HEADER: &str = "x-riot-token";
const MATCH_IDS_PAGE_SIZE: u32 = 100;
const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("player handle `{0}` has no `#` tag line")]
    InvalidHandle(String),
    #[error("no PUUID could be resolved for `{0}`")]
    UnresolvedPlayer(String),
    #[error("invalid API base url `{0}`")]
    InvalidBaseUrl(String),
    #[error("API key is not a valid header value")]
    InvalidApiKey,
    #[error("day window for {0} cannot be represented")]
    InvalidDay(NaiveDate),
}

/// Upstream provider of per-player, per-day activities.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Activities created within `day`; an empty list when there are none.
    async fn fetch_day(
        &self,
        player: &str,
        day: NaiveDate,
    ) -> Result<Vec<ActivityRecord>, AdapterError>;
}

/// Removes the Unicode bidi isolate marks (U+2066..U+2069) chat clients wrap handles in.
pub fn clean_handle(handle: &str) -> String {
    handle
        .chars()
        .filter(|c| !('\u{2066}'..='\u{2069}').contains(c))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiotId {
    pub game_name: String,
    pub tag_line: String,
}

/// Splits `GameName#TAG` on the first `#`.
pub fn split_handle(handle: &str) -> Result<RiotId, AdapterError> {
    let cleaned = clean_handle(handle);
    match cleaned.split_once('#') {
        Some((name, tag)) if !name.is_empty() && !tag.is_empty() => Ok(RiotId {
            game_name: name.to_string(),
            tag_line: tag.to_string(),
        }),
        _ => Err(AdapterError::InvalidHandle(handle.to_string())),
    }
}

/// `[start, start + 24h)` in epoch seconds for `day` at the given offset.
pub fn day_window(day: NaiveDate, offset: FixedOffset) -> Result<(i64, i64), AdapterError> {
    let start = day
        .and_time(NaiveTime::MIN)
        .and_local_timezone(offset)
        .single()
        .ok_or(AdapterError::InvalidDay(day))?
        .timestamp();
    Ok((start, start + SECONDS_PER_DAY))
}

#[derive(Debug, Clone)]
pub struct RiotApiConfig {
    pub api_key: String,
    pub base_url: String,
    pub rate_delay: Duration,
    pub day_offset: FixedOffset,
    pub backoff: BackoffPolicy,
}

impl RiotApiConfig {
    pub fn regional_base_url(routing: &str) -> String {
        format!("https://{routing}.api.riotgames.com")
    }
}

#[derive(Debug, Deserialize)]
struct AccountDto {
    puuid: Option<String>,
}

/// Riot API client: identity resolution, windowed match listing and per-match fetch.
#[derive(Debug)]
pub struct RiotClient {
    http: Arc<HttpFetcher>,
    base_url: Url,
    headers: HeaderMap,
    rate_delay: Duration,
    day_offset: FixedOffset,
    backoff: BackoffPolicy,
    puuids: Mutex<HashMap<String, String>>,
    archive: Option<RawPayloadArchive>,
}

impl RiotClient {
    pub fn new(http: Arc<HttpFetcher>, config: RiotApiConfig) -> Result<Self, AdapterError> {
        let base_url = Url::parse(&config.base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| AdapterError::InvalidBaseUrl(config.base_url.clone()))?;

        let mut token =
            HeaderValue::from_str(&config.api_key).map_err(|_| AdapterError::InvalidApiKey)?;
        token.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(RIOT_TOKEN_HEADER, token);

        Ok(Self {
            http,
            base_url,
            headers,
            rate_delay: config.rate_delay,
            day_offset: config.day_offset,
            backoff: config.backoff,
            puuids: Mutex::new(HashMap::new()),
            archive: None,
        })
    }

    pub fn with_archive(mut self, archive: RawPayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AdapterError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AdapterError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Fetch failures are logged and collapse to `None`.
    async fn get(&self, url: &Url) -> Option<FetchedResponse> {
        match self
            .http
            .fetch_bytes(RIOT_SOURCE_ID, url.as_str(), &self.headers, &self.backoff)
            .await
        {
            Ok(response) => Some(response),
            Err(FetchError::HttpStatus { status: 404, url }) => {
                debug!(%url, "riot resource not found");
                None
            }
            Err(err) => {
                warn!(%url, error = %err, "riot request yielded no data");
                None
            }
        }
    }

    async fn get_json(&self, url: &Url) -> Option<JsonValue> {
        let response = self.get(url).await?;
        match serde_json::from_slice(&response.body) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(url = %response.final_url, error = %err, "riot response is not JSON");
                None
            }
        }
    }

    /// Resolves a handle to its PUUID, memoized for the lifetime of the client.
    pub async fn resolve_puuid(&self, handle: &str) -> Result<String, AdapterError> {
        let riot_id = split_handle(handle)?;
        let memo_key = format!("{}#{}", riot_id.game_name, riot_id.tag_line);
        if let Some(puuid) = self.puuids.lock().await.get(&memo_key) {
            return Ok(puuid.clone());
        }

        let url = self.endpoint(&[
            "riot",
            "account",
            "v1",
            "accounts",
            "by-riot-id",
            &riot_id.game_name,
            &riot_id.tag_line,
        ])?;
        let puuid = self
            .get_json(&url)
            .await
            .and_then(|value| serde_json::from_value::<AccountDto>(value).ok())
            .and_then(|account| account.puuid)
            .filter(|puuid| !puuid.is_empty())
            .ok_or_else(|| AdapterError::UnresolvedPlayer(handle.to_string()))?;

        self.puuids.lock().await.insert(memo_key, puuid.clone());
        Ok(puuid)
    }

    pub async fn list_match_ids(
        &self,
        puuid: &str,
        start: i64,
        end: i64,
    ) -> Result<Vec<String>, AdapterError> {
        let mut url = self.endpoint(&["lol", "match", "v5", "matches", "by-puuid", puuid, "ids"])?;
        url.query_pairs_mut()
            .append_pair("startTime", &start.to_string())
            .append_pair("endTime", &end.to_string())
            .append_pair("count", &MATCH_IDS_PAGE_SIZE.to_string());

        let Some(value) = self.get_json(&url).await else {
            return Ok(Vec::new());
        };
        match serde_json::from_value::<Vec<String>>(value) {
            Ok(ids) => Ok(ids),
            Err(err) => {
                warn!(error = %err, "match id listing is not a list of strings");
                Ok(Vec::new())
            }
        }
    }

    /// Fetches one match and validates its shape. Unusable payloads are logged and skipped.
    pub async fn fetch_match(
        &self,
        match_id: &str,
        player: &str,
        day: NaiveDate,
    ) -> Result<Option<ActivityRecord>, AdapterError> {
        let url = self.endpoint(&["lol", "match", "v5", "matches", match_id])?;
        let Some(response) = self.get(&url).await else {
            return Ok(None);
        };

        if let Some(archive) = &self.archive {
            match archive.store(day, player, &response.body).await {
                Ok(stored) => debug!(
                    match_id,
                    path = %stored.relative_path.display(),
                    deduplicated = stored.deduplicated,
                    "archived raw payload"
                ),
                Err(err) => warn!(match_id, error = %err, "failed to archive raw payload"),
            }
        }

        let record = serde_json::from_slice::<JsonValue>(&response.body)
            .map_err(|err| err.to_string())
            .and_then(|payload| {
                ActivityRecord::from_payload(payload).map_err(|err| err.to_string())
            });
        match record {
            Ok(record) => Ok(Some(record)),
            Err(reason) => {
                warn!(match_id, %reason, "skipping malformed match payload");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl ActivitySource for RiotClient {
    fn source_id(&self) -> &'static str {
        RIOT_SOURCE_ID
    }

    async fn fetch_day(
        &self,
        player: &str,
        day: NaiveDate,
    ) -> Result<Vec<ActivityRecord>, AdapterError> {
        let puuid = self.resolve_puuid(player).await?;
        let (start, end) = day_window(day, self.day_offset)?;
        let match_ids = self.list_match_ids(&puuid, start, end).await?;
        if match_ids.is_empty() {
            info!(player, %day, "no matches in window");
            return Ok(Vec::new());
        }

        let mut records = Vec::with_capacity(match_ids.len());
        for (idx, match_id) in match_ids.iter().enumerate() {
            let Some(record) = self.fetch_match(match_id, player, day).await? else {
                continue;
            };
            records.push(record);
            if idx + 1 < match_ids.len() && !self.rate_delay.is_zero() {
                tokio::time::sleep(self.rate_delay).await;
            }
        }

        info!(
            player,
            %day,
            listed = match_ids.len(),
            fetched = records.len(),
            "fetched matches"
        );
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_lose_bidi_isolates_before_splitting() {
        let riot_id = split_handle("\u{2068}Monty Gard\u{2069}#RU1").unwrap();
        assert_eq!(riot_id.game_name, "Monty Gard");
        assert_eq!(riot_id.tag_line, "RU1");

        let riot_id = split_handle("name#tag#extra").unwrap();
        assert_eq!(riot_id.tag_line, "tag#extra");
    }

    #[test]
    fn handles_without_tag_are_invalid() {
        assert!(matches!(split_handle("Breaksthesilence"), Err(AdapterError::InvalidHandle(_))));
        assert!(matches!(split_handle("name#"), Err(AdapterError::InvalidHandle(_))));
        assert!(matches!(split_handle("\u{2066}#RU1"), Err(AdapterError::InvalidHandle(_))));
    }

    #[test]
    fn day_window_spans_one_day_at_offset() {
        let day = NaiveDate::from_ymd_opt(2025, 6, 9).unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(day_window(day, utc).unwrap(), (1_749_427_200, 1_749_513_600));

        let moscow = FixedOffset::east_opt(3 * 3600).unwrap();
        let (start, end) = day_window(day, moscow).unwrap();
        assert_eq!(start, 1_749_427_200 - 3 * 3600);
        assert_eq!(end - start, SECONDS_PER_DAY);
    }

    #[test]
    fn endpoints_encode_riot_ids_as_path_segments() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let client = RiotClient::new(
            http,
            RiotApiConfig {
                api_key: "RGAPI-test".to_string(),
                base_url: RiotApiConfig::regional_base_url("europe"),
                rate_delay: Duration::ZERO,
                day_offset: FixedOffset::east_opt(0).unwrap(),
                backoff: BackoffPolicy::default(),
            },
        )
        .unwrap();
        let url = client
            .endpoint(&["riot", "account", "v1", "accounts", "by-riot-id", "Monty Gard", "RU1"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://europe.api.riotgames.com/riot/account/v1/accounts/by-riot-id/Monty%20Gard/RU1"
        );
    }

    #[test]
    fn api_key_must_be_a_header_value() {
        let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
        let err = RiotClient::new(
            http,
            RiotApiConfig {
                api_key: "bad\nkey".to_string(),
                base_url: "http://127.0.0.1:1".to_string(),
                rate_delay: Duration::ZERO,
                day_offset: FixedOffset::east_opt(0).unwrap(),
                backoff: BackoffPolicy::default(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, AdapterError::InvalidApiKey));
    }
}
