//! AniList (anilist.co) tracker implementation.
//!
//! Login uses the OAuth authorization-code flow with the pin redirect: the
//! user opens [`Tracker::authorization_url`], approves the application and
//! pastes the displayed code back. Everything else goes through GraphQL.

use super::{Credentials, Tracker};
use crate::config::{NetworkConfig, TrackerCredentials};
use crate::error::TrackerError;
use crate::sources::create_http_client;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::RwLock;
use url::Url;

const SITE_URL: &str = "https://anilist.co";
const GRAPHQL_URL: &str = "https://graphql.anilist.co";
const REDIRECT_URI: &str = "https://anilist.co/api/v2/oauth/pin";

const VIEWER_QUERY: &str = "query { Viewer { id name } }";

const PROGRESS_QUERY: &str = "query ($mediaId: Int, $userId: Int) { \
    MediaList(mediaId: $mediaId, userId: $userId) { progress } }";

const SAVE_PROGRESS_MUTATION: &str = "mutation ($mediaId: Int, $progress: Int) { \
    SaveMediaListEntry(mediaId: $mediaId, progress: $progress) { progress } }";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(default)]
    status: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct ViewerData {
    #[serde(rename = "Viewer")]
    viewer: Viewer,
}

#[derive(Debug, Deserialize)]
struct Viewer {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProgressData {
    #[serde(rename = "MediaList")]
    media_list: Option<MediaList>,
}

#[derive(Debug, Deserialize)]
struct MediaList {
    #[serde(default)]
    progress: Option<u32>,
}

pub struct AniList {
    client: reqwest::Client,
    site_url: String,
    graphql_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<String>>,
    viewer_id: RwLock<Option<u64>>,
}

impl AniList {
    pub fn new(
        network: &NetworkConfig,
        credentials: &TrackerCredentials,
    ) -> Result<Self, TrackerError> {
        Self::with_base_urls(network, credentials, SITE_URL, GRAPHQL_URL)
    }

    /// Creates a tracker with custom OAuth and GraphQL endpoints.
    pub fn with_base_urls(
        network: &NetworkConfig,
        credentials: &TrackerCredentials,
        site_url: &str,
        graphql_url: &str,
    ) -> Result<Self, TrackerError> {
        Ok(Self {
            client: create_http_client(network)?,
            site_url: site_url.trim_end_matches('/').to_string(),
            graphql_url: graphql_url.to_string(),
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            token: RwLock::new(credentials.access_token.clone()),
            viewer_id: RwLock::new(None),
        })
    }

    fn token(&self) -> Result<String, TrackerError> {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(TrackerError::Unauthenticated)
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token;
        *self.viewer_id.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Runs a GraphQL document with the session token.
    ///
    /// `Ok(None)` means the server answered 404 for the requested object.
    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
    ) -> Result<Option<T>, TrackerError> {
        let response = self
            .client
            .post(&self.graphql_url)
            .bearer_auth(self.token()?)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!("AniList rejected the access token");
            self.set_token(None);
            return Err(TrackerError::Unauthenticated);
        }

        // GraphQL errors arrive with a non-2xx status and a JSON body.
        let body: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| TrackerError::ParseError(e.to_string()))?;

        if let Some(error) = body.errors.first() {
            return match error.status {
                Some(404) => Ok(None),
                Some(401) => {
                    self.set_token(None);
                    Err(TrackerError::Unauthenticated)
                }
                _ => Err(TrackerError::ApiError(error.message.clone())),
            };
        }
        body.data
            .map(Some)
            .ok_or_else(|| TrackerError::ParseError("response has no data".to_string()))
    }

    async fn viewer(&self) -> Result<Viewer, TrackerError> {
        let data: ViewerData = self
            .graphql(VIEWER_QUERY, json!({}))
            .await?
            .ok_or_else(|| TrackerError::ApiError("no viewer for token".to_string()))?;
        *self.viewer_id.write().unwrap_or_else(|e| e.into_inner()) = Some(data.viewer.id);
        Ok(data.viewer)
    }

    async fn viewer_id(&self) -> Result<u64, TrackerError> {
        let cached = *self.viewer_id.read().unwrap_or_else(|e| e.into_inner());
        match cached {
            Some(id) => Ok(id),
            None => Ok(self.viewer().await?.id),
        }
    }
}

fn parse_media_id(media_id: &str) -> Result<u64, TrackerError> {
    media_id
        .parse()
        .map_err(|_| TrackerError::ApiError(format!("invalid AniList media id: {media_id}")))
}

#[async_trait]
impl Tracker for AniList {
    fn id(&self) -> &'static str {
        "anilist"
    }

    fn name(&self) -> &'static str {
        "AniList"
    }

    fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    async fn verify_authenticated(&self) -> Result<(), TrackerError> {
        self.viewer().await.map(|_| ())
    }

    fn authorization_url(&self) -> Option<String> {
        let mut url = Url::parse(&format!("{}/api/v2/oauth/authorize", self.site_url)).ok()?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", REDIRECT_URI)
            .append_pair("response_type", "code");
        Some(url.into())
    }

    async fn generate_token(&self, credentials: &Credentials) -> Result<(), TrackerError> {
        let Credentials::Code(code) = credentials else {
            return Err(TrackerError::Unsupported("password login"));
        };

        let response = self
            .client
            .post(format!("{}/api/v2/oauth/token", self.site_url))
            .json(&json!({
                "grant_type": "authorization_code",
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "redirect_uri": REDIRECT_URI,
                "code": code.trim(),
            }))
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED
        ) {
            return Err(TrackerError::ApiError(
                "authorization code was rejected".to_string(),
            ));
        }

        let token: TokenResponse = response
            .error_for_status()?
            .json()
            .await
            .map_err(|e| TrackerError::ParseError(e.to_string()))?;
        self.set_token(Some(token.access_token));
        tracing::info!("Authenticated with AniList");
        Ok(())
    }

    async fn authenticated_user_name(&self) -> Result<String, TrackerError> {
        Ok(self.viewer().await?.name)
    }

    async fn chapters_read(&self, media_id: &str) -> Result<u32, TrackerError> {
        let media_id = parse_media_id(media_id)?;
        let user_id = self.viewer_id().await?;
        let data: Option<ProgressData> = self
            .graphql(
                PROGRESS_QUERY,
                json!({ "mediaId": media_id, "userId": user_id }),
            )
            .await?;
        Ok(data
            .and_then(|d| d.media_list)
            .and_then(|list| list.progress)
            .unwrap_or(0))
    }

    async fn set_chapters_read(&self, media_id: &str, count: u32) -> Result<(), TrackerError> {
        let media_id = parse_media_id(media_id)?;
        let _: Option<Value> = self
            .graphql(
                SAVE_PROGRESS_MUTATION,
                json!({ "mediaId": media_id, "progress": count }),
            )
            .await?;
        tracing::debug!(media_id, count, "Updated AniList progress");
        Ok(())
    }

    fn access_token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn deauthenticate(&self) {
        self.set_token(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trackers::ProgressUpdate;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tracker(server: &MockServer, token: Option<&str>) -> AniList {
        let credentials = TrackerCredentials {
            client_id: "1234".to_string(),
            client_secret: "secret".to_string(),
            access_token: token.map(str::to_string),
        };
        AniList::with_base_urls(
            &NetworkConfig::default(),
            &credentials,
            &server.uri(),
            &format!("{}/graphql", server.uri()),
        )
        .unwrap()
    }

    async fn mount_viewer(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_string_contains("Viewer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "Viewer": { "id": 5, "name": "reader" } }
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn test_authorization_url() {
        let credentials = TrackerCredentials {
            client_id: "1234".to_string(),
            ..Default::default()
        };
        let anilist = AniList::new(&NetworkConfig::default(), &credentials).unwrap();
        let url = anilist.authorization_url().unwrap();
        assert!(url.starts_with("https://anilist.co/api/v2/oauth/authorize?"));
        assert!(url.contains("client_id=1234"));
        assert!(url.contains("response_type=code"));
    }

    #[tokio::test]
    async fn test_code_exchange() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/oauth/token"))
            .and(body_string_contains("\"code\":\"xyz\""))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "access_token": "tok" })),
            )
            .mount(&server)
            .await;
        mount_viewer(&server).await;

        let anilist = tracker(&server, None);
        anilist
            .generate_token(&Credentials::Code(" xyz\n".to_string()))
            .await
            .unwrap();
        assert!(anilist.is_authenticated());
        assert_eq!(anilist.authenticated_user_name().await.unwrap(), "reader");
    }

    #[tokio::test]
    async fn test_unlisted_media_reads_zero() {
        let server = MockServer::start().await;
        mount_viewer(&server).await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_string_contains("MediaList"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "data": { "MediaList": null },
                "errors": [{ "message": "Not Found.", "status": 404 }]
            })))
            .mount(&server)
            .await;

        let anilist = tracker(&server, Some("tok"));
        assert_eq!(anilist.chapters_read("30013").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_progress_only_advances() {
        let server = MockServer::start().await;
        mount_viewer(&server).await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_string_contains("MediaList(mediaId"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "MediaList": { "progress": 12 } }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .and(body_string_contains("SaveMediaListEntry"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": { "SaveMediaListEntry": { "progress": 13 } }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let anilist = tracker(&server, Some("tok"));
        assert_eq!(
            anilist.update_chapters_read("30013", 10).await.unwrap(),
            ProgressUpdate::Unchanged { current: 12 }
        );
        assert_eq!(
            anilist.update_chapters_read("30013", 13).await.unwrap(),
            ProgressUpdate::Advanced { from: 12, to: 13 }
        );
    }

    #[tokio::test]
    async fn test_password_login_unsupported() {
        let server = MockServer::start().await;
        let anilist = tracker(&server, None);
        let err = anilist
            .generate_token(&Credentials::Password {
                username: "a".to_string(),
                password: "b".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Unsupported(_)));
    }
}
