use super::{CdnPreference, LivenessOracle, StreamInfo, StreamUrlOptions};
use crate::error::OracleError;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const ROOM_INIT_URL: &str = "https://api.live.bilibili.com/room/v1/Room/room_init";
const PLAY_INFO_URL: &str = "https://api.live.bilibili.com/xlive/web-room/v2/index/getRoomPlayInfo";
const ROOM_INFO_URL: &str = "https://api.live.bilibili.com/xlive/web-room/v1/index/getInfoByRoom";

const REFERER: &str = "https://live.bilibili.com";
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36 Edg/108.0.1462.54";

/// Liveness oracle for bilibili live rooms.
pub struct BilibiliOracle {
    client: Client,
    room_id: String,
}

impl BilibiliOracle {
    pub fn new(room_id: &str) -> Result<Self, OracleError> {
        let client = Client::builder().timeout(Duration::from_secs(5)).build()?;

        Ok(Self {
            client,
            room_id: room_id.to_string(),
        })
    }

    async fn room_init(&self) -> Result<Value, OracleError> {
        let response = self
            .client
            .get(ROOM_INIT_URL)
            .query(&[("id", self.room_id.as_str())])
            .send()
            .await?
            .json::<Value>()
            .await?;

        Ok(response)
    }

    async fn get_with_headers(&self, url: &str, query: &[(&str, String)]) -> Result<Value, OracleError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .header("Referer", REFERER)
            .header("User-Agent", USER_AGENT)
            .send()
            .await?
            .json::<Value>()
            .await?;

        Ok(response)
    }
}

#[async_trait]
impl LivenessOracle for BilibiliOracle {
    async fn is_available(&self) -> Result<bool, OracleError> {
        let response = self.room_init().await?;
        Ok(response_code(&response)? == 0)
    }

    async fn is_on_air(&self) -> Result<bool, OracleError> {
        let response = self.room_init().await?;
        on_air_from_response(&response)
    }

    async fn resolve_stream_url(
        &self,
        options: &StreamUrlOptions,
    ) -> Result<String, OracleError> {
        let init = self.room_init().await?;
        let room_id = init
            .pointer("/data/room_id")
            .and_then(Value::as_u64)
            .ok_or_else(|| OracleError::parse("room_init response missing data.room_id"))?;

        let query = [
            ("room_id", room_id.to_string()),
            ("platform", "web".to_string()),
            ("protocol", "0,1".to_string()),
            ("format", "0,1,2".to_string()),
            ("codec", "0".to_string()),
            ("qn", "20000".to_string()),
            ("ptype", "8".to_string()),
            ("dolby", "5".to_string()),
            ("panorama", "1".to_string()),
        ];
        let response = self.get_with_headers(PLAY_INFO_URL, &query).await?;

        let url = stream_url_from_play_info(&response, options)?;
        debug!("Resolved bilibili stream URL for room {}", self.room_id);
        Ok(url)
    }

    async fn stream_info(&self) -> Result<StreamInfo, OracleError> {
        let query = [("room_id", self.room_id.clone())];
        let response = self.get_with_headers(ROOM_INFO_URL, &query).await?;
        info_from_response(&response)
    }

    fn stream_headers(&self) -> Vec<(String, String)> {
        vec![
            ("Referer".to_string(), REFERER.to_string()),
            ("User-Agent".to_string(), USER_AGENT.to_string()),
        ]
    }
}

fn response_code(response: &Value) -> Result<i64, OracleError> {
    response
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| OracleError::parse("response missing code field"))
}

/// A room is on air when the API accepts it and reports live_status == 1.
/// A rejected room (non-zero code) is simply not live.
pub(crate) fn on_air_from_response(response: &Value) -> Result<bool, OracleError> {
    if response_code(response)? != 0 {
        return Ok(false);
    }

    let live_status = response
        .pointer("/data/live_status")
        .and_then(Value::as_i64)
        .ok_or_else(|| OracleError::parse("room_init response missing data.live_status"))?;

    Ok(live_status == 1)
}

/// Pick a playable URL out of the getRoomPlayInfo response.
///
/// Candidates are host + base_url + extra for each advertised url_info
/// entry. Without a preference the first non-`mcdn.` candidate wins, since
/// the multicast CDN hosts are not reachable from outside the ISP networks.
pub(crate) fn stream_url_from_play_info(
    response: &Value,
    options: &StreamUrlOptions,
) -> Result<String, OracleError> {
    let resolve = || -> Option<String> {
        let codec = response.pointer("/data/playurl_info/playurl/stream/0/format/0/codec/0")?;
        let base_url = codec.get("base_url")?.as_str()?;
        let url_info = codec.get("url_info")?.as_array()?;

        let mut candidates = Vec::new();
        let mut last_extra = "";
        for info in url_info {
            let host = info.get("host")?.as_str()?;
            let extra = info.get("extra")?.as_str()?;
            candidates.push(format!("{}{}{}", host, base_url, extra));
            last_extra = extra;
        }
        if candidates.is_empty() {
            return None;
        }

        let url = match &options.cdn {
            Some(CdnPreference::Index(index)) => {
                candidates[(*index).min(candidates.len() - 1)].clone()
            }
            Some(CdnPreference::Host(host)) => {
                format!("https://{}.bilivideo.com{}{}", host, base_url, last_extra)
            }
            None => candidates
                .iter()
                .find(|uri| !uri.contains("mcdn."))
                .unwrap_or(&candidates[0])
                .clone(),
        };
        Some(url)
    };

    resolve().ok_or_else(|| OracleError::StreamResolve {
        provider: "bilibili".to_string(),
    })
}

pub(crate) fn info_from_response(response: &Value) -> Result<StreamInfo, OracleError> {
    let field = |pointer: &str| -> Result<String, OracleError> {
        response
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| OracleError::parse(format!("room info missing {}", pointer)))
    };

    Ok(StreamInfo {
        title: field("/data/room_info/title")?,
        streamer: field("/data/anchor_info/base_info/uname")?,
        avatar_url: field("/data/anchor_info/base_info/face")?,
        keyframe_url: field("/data/room_info/keyframe")?,
    })
}
