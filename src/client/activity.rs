//! Activity search and token refresh against the Showstart WAP API.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use super::{ClientError, HttpSend, ReqwestSender, ResilientTransport};
use crate::auth::{Credentials, RequestSigner, SessionTokens};

pub const SEARCH_PATH: &str = "/wap/activity/list";
pub const TOKEN_PATH: &str = "/waf/gettoken";

const SEARCH_PAGE_SIZE: u32 = 20;
const STATE_OK: &str = "1";

/// An event listing as returned by the upstream search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activity {
    pub id: i64,
    pub title: String,
    pub show_time: String,
    pub site_name: String,
    /// Label names in upstream order.
    pub labels: Vec<String>,
}

// --- Wire types ---

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    state: Option<serde_json::Value>,
    msg: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResult {
    #[serde(default, rename = "activityInfo")]
    activity_info: Vec<Option<WireActivity>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireActivity {
    #[serde(default)]
    activity_id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    show_time: String,
    #[serde(default)]
    site_name: String,
    #[serde(default)]
    other_label: Vec<Option<WireLabel>>,
}

#[derive(Debug, Deserialize)]
struct WireLabel {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResult {
    #[serde(default)]
    access_token: Option<AccessToken>,
    #[serde(default)]
    id_token: Option<IdToken>,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    #[serde(default)]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct IdToken {
    #[serde(default)]
    id_token: String,
}

impl From<WireActivity> for Activity {
    fn from(w: WireActivity) -> Self {
        Self {
            id: w.activity_id,
            title: w.title,
            show_time: w.show_time,
            site_name: w.site_name,
            labels: w.other_label.into_iter().flatten().map(|l| l.name).collect(),
        }
    }
}

/// Decode an envelope, surfacing a non-OK `state` as an API error.
fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<Option<T>, ClientError> {
    let envelope: Envelope<T> = serde_json::from_slice(body)?;
    if let Some(state) = envelope.state {
        let state = match state {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        if state != STATE_OK {
            return Err(ClientError::Api {
                state,
                msg: envelope.msg.unwrap_or_default(),
            });
        }
    }
    Ok(envelope.result)
}

/// What the monitor needs from the upstream platform.
#[async_trait]
pub trait ActivitySource: Send + Sync {
    /// Activities for `keyword` in `city`, in upstream order. Empty is not an error.
    async fn search(&self, city: &str, keyword: &str) -> Result<Vec<Activity>, ClientError>;

    /// Best-effort session refresh.
    async fn refresh_token(&self) -> Result<(), ClientError>;
}

/// Authenticated client bound to one credential bundle.
pub struct ShowStartClient<S = ReqwestSender> {
    signer: RequestSigner,
    transport: ResilientTransport<S>,
    session: RwLock<SessionTokens>,
}

impl ShowStartClient<ReqwestSender> {
    pub fn new(base_url: String, creds: Credentials) -> Result<Self, reqwest::Error> {
        Ok(Self::with_parts(
            RequestSigner::new(base_url, creds),
            ResilientTransport::new(ReqwestSender::new()?),
        ))
    }
}

impl<S: HttpSend> ShowStartClient<S> {
    pub fn with_parts(signer: RequestSigner, transport: ResilientTransport<S>) -> Self {
        Self {
            signer,
            transport,
            session: RwLock::new(SessionTokens::default()),
        }
    }

    pub fn session(&self) -> SessionTokens {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn post(&self, path: &str, body: &str) -> Result<Vec<u8>, ClientError> {
        let request = self
            .signer
            .build(Method::POST, path, body, &self.session())?;
        self.transport.execute(&request).await
    }
}

#[async_trait]
impl<S: HttpSend> ActivitySource for ShowStartClient<S> {
    async fn search(&self, city: &str, keyword: &str) -> Result<Vec<Activity>, ClientError> {
        let creds = self.signer.credentials();
        let body = serde_json::json!({
            "cityCode": city,
            "keyword": keyword,
            "pageNo": 1,
            "pageSize": SEARCH_PAGE_SIZE,
            "st_flpv": creds.st_flpv,
            "sign": creds.sign,
        })
        .to_string();

        let raw = self.post(SEARCH_PATH, &body).await?;
        let result: SearchResult = decode(&raw)?.unwrap_or_default();
        let activities: Vec<Activity> = result
            .activity_info
            .into_iter()
            .flatten()
            .map(Activity::from)
            .collect();

        debug!(
            city = city,
            keyword = keyword,
            activities = activities.len(),
            "activity search complete"
        );
        Ok(activities)
    }

    async fn refresh_token(&self) -> Result<(), ClientError> {
        let raw = self.post(TOKEN_PATH, "{}").await?;
        let result: Option<TokenResult> = decode(&raw)?;

        let (access, id) = match result {
            Some(TokenResult {
                access_token: Some(a),
                id_token: Some(i),
            }) if !a.access_token.is_empty() && !i.id_token.is_empty() => {
                (a.access_token, i.id_token)
            }
            _ => {
                return Err(ClientError::Api {
                    state: STATE_OK.to_string(),
                    msg: "token missing from response".to_string(),
                })
            }
        };

        let mut session = self
            .session
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        session.access_token = access;
        session.id_token = id;
        info!("session token refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SignedRequest;
    use crate::client::{HttpResponse, SendError};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Returns canned bodies and keeps every request it saw.
    struct CannedSender {
        replies: Mutex<VecDeque<(u16, String)>>,
        seen: Mutex<Vec<SignedRequest>>,
    }

    impl CannedSender {
        fn with(replies: &[(u16, &str)]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .iter()
                        .map(|(s, b)| (*s, b.to_string()))
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HttpSend for CannedSender {
        async fn send(&self, request: &SignedRequest) -> Result<HttpResponse, SendError> {
            self.seen.lock().unwrap().push(request.clone());
            let (status, body) = self.replies.lock().unwrap().pop_front().unwrap();
            Ok(HttpResponse {
                status,
                body: body.into_bytes(),
            })
        }
    }

    fn client(sender: Arc<CannedSender>) -> ShowStartClient<Arc<CannedSender>> {
        let creds = Credentials {
            sign: "s".to_string(),
            token: "t".to_string(),
            st_flpv: "flpv".to_string(),
            ..Credentials::default()
        };
        ShowStartClient::with_parts(
            RequestSigner::new("https://api.example/v3".to_string(), creds),
            ResilientTransport::new(sender),
        )
    }

    #[tokio::test]
    async fn test_search_parses_activities_in_order() {
        let sender = CannedSender::with(&[(
            200,
            r#"{"state":"1","result":{"activityInfo":[
                {"activityId":123,"title":"LANY 2025 巡演","showTime":"2025.05.01","siteName":"Arena",
                 "otherLabel":[{"name":"支持定时购票"},null]},
                null,
                {"activityId":7,"title":"Other"}
            ]}}"#,
        )]);
        let client = client(sender.clone());

        let activities = client.search("99999", "LANY").await.unwrap();
        assert_eq!(activities.len(), 2);
        assert_eq!(activities[0].id, 123);
        assert_eq!(activities[0].labels, vec!["支持定时购票"]);
        assert_eq!(activities[0].site_name, "Arena");
        assert_eq!(activities[1].id, 7);
        assert!(activities[1].labels.is_empty());

        let seen = sender.seen.lock().unwrap();
        assert_eq!(seen[0].path, SEARCH_PATH);
        assert_eq!(seen[0].url, "https://api.example/v3/wap/activity/list");
        // Search bodies travel encrypted.
        assert!(seen[0].body.starts_with(r#"{"q":"#));
    }

    #[tokio::test]
    async fn test_search_empty_result_is_ok() {
        let sender = CannedSender::with(&[(200, r#"{"state":"1","result":{}}"#)]);
        let activities = client(sender).search("99999", "nobody").await.unwrap();
        assert!(activities.is_empty());

        let sender = CannedSender::with(&[(200, r#"{"state":1}"#)]);
        let activities = client(sender).search("99999", "nobody").await.unwrap();
        assert!(activities.is_empty());
    }

    #[tokio::test]
    async fn test_search_api_state_error() {
        let sender = CannedSender::with(&[(200, r#"{"state":"-1","msg":"login required"}"#)]);
        let err = client(sender).search("99999", "LANY").await.unwrap_err();
        match err {
            ClientError::Api { state, msg } => {
                assert_eq!(state, "-1");
                assert_eq!(msg, "login required");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_token_updates_session_headers() {
        let sender = CannedSender::with(&[
            (
                200,
                r#"{"state":"1","result":{"accessToken":{"access_token":"AT"},"idToken":{"id_token":"IT"}}}"#,
            ),
            (200, r#"{"state":"1","result":{"activityInfo":[]}}"#),
        ]);
        let client = client(sender.clone());

        client.refresh_token().await.unwrap();
        assert_eq!(client.session().access_token, "AT");
        client.search("99999", "LANY").await.unwrap();

        let seen = sender.seen.lock().unwrap();
        assert_eq!(seen[0].path, TOKEN_PATH);
        assert_eq!(seen[0].headers["cusat"], "nil");
        assert_eq!(seen[1].headers["cusat"], "AT");
        assert_eq!(seen[1].headers["cusit"], "IT");
    }

    #[tokio::test]
    async fn test_refresh_token_missing_fields_is_error() {
        let sender = CannedSender::with(&[(200, r#"{"state":"1","result":{}}"#)]);
        let client = client(sender);
        assert!(client.refresh_token().await.is_err());
        assert_eq!(client.session(), SessionTokens::default());
    }

    #[tokio::test]
    async fn test_rejected_status_propagates() {
        let sender = CannedSender::with(&[(403, "forbidden")]);
        let err = client(sender).search("99999", "LANY").await.unwrap_err();
        assert!(matches!(err, ClientError::Rejected { status: 403, .. }));
    }
}
