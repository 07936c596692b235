//! Kitsu (kitsu.io) tracker implementation.
//!
//! Authenticates with the OAuth password grant and talks to the JSON:API edge
//! endpoints. Progress lives on the user's library entry for a manga.

use super::{Credentials, Tracker};
use crate::config::{NetworkConfig, TrackerCredentials};
use crate::error::TrackerError;
use crate::sources::create_http_client;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::json;
use std::sync::RwLock;

const BASE_URL: &str = "https://kitsu.io";
const JSON_API: &str = "application/vnd.api+json";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct Document<T> {
    data: Vec<Resource<T>>,
}

#[derive(Debug, Deserialize)]
struct Resource<T> {
    id: String,
    attributes: T,
}

#[derive(Debug, Deserialize)]
struct UserAttributes {
    name: String,
}

#[derive(Debug, Deserialize)]
struct EntryAttributes {
    #[serde(default)]
    progress: u32,
}

/// A user's library entry for one manga.
struct LibraryEntry {
    id: String,
    progress: u32,
}

pub struct Kitsu {
    client: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<Option<String>>,
    user_id: RwLock<Option<String>>,
}

impl Kitsu {
    pub fn new(
        network: &NetworkConfig,
        credentials: &TrackerCredentials,
    ) -> Result<Self, TrackerError> {
        Self::with_base_url(network, credentials, BASE_URL)
    }

    /// Creates a tracker talking to `base_url` instead of kitsu.io.
    pub fn with_base_url(
        network: &NetworkConfig,
        credentials: &TrackerCredentials,
        base_url: &str,
    ) -> Result<Self, TrackerError> {
        Ok(Self {
            client: create_http_client(network)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            client_id: credentials.client_id.clone(),
            client_secret: credentials.client_secret.clone(),
            token: RwLock::new(credentials.access_token.clone()),
            user_id: RwLock::new(None),
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
        *self.user_id.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Checks a response, dropping the token on 401.
    fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, TrackerError> {
        if response.status() == StatusCode::UNAUTHORIZED {
            tracing::warn!("Kitsu rejected the access token");
            self.set_token(None);
            return Err(TrackerError::Unauthenticated);
        }
        Ok(response.error_for_status()?)
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Document<T>, TrackerError> {
        let response = self
            .client
            .get(format!("{}/api/edge/{}", self.base_url, path))
            .bearer_auth(self.token()?)
            .header(reqwest::header::ACCEPT, JSON_API)
            .query(query)
            .send()
            .await?;
        self.check(response)?
            .json()
            .await
            .map_err(|e| TrackerError::ParseError(e.to_string()))
    }

    async fn current_user(&self) -> Result<Resource<UserAttributes>, TrackerError> {
        let document: Document<UserAttributes> =
            self.get("users", &[("filter[self]", "true")]).await?;
        let user = document
            .data
            .into_iter()
            .next()
            .ok_or_else(|| TrackerError::ApiError("no user for token".to_string()))?;
        *self.user_id.write().unwrap_or_else(|e| e.into_inner()) = Some(user.id.clone());
        Ok(user)
    }

    async fn user_id(&self) -> Result<String, TrackerError> {
        let cached = self
            .user_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match cached {
            Some(id) => Ok(id),
            None => Ok(self.current_user().await?.id),
        }
    }

    async fn library_entry(&self, media_id: &str) -> Result<Option<LibraryEntry>, TrackerError> {
        let user_id = self.user_id().await?;
        let document: Document<EntryAttributes> = self
            .get(
                "library-entries",
                &[("filter[userId]", user_id.as_str()), ("filter[mangaId]", media_id)],
            )
            .await?;
        Ok(document.data.into_iter().next().map(|entry| LibraryEntry {
            id: entry.id,
            progress: entry.attributes.progress,
        }))
    }
}

#[async_trait]
impl Tracker for Kitsu {
    fn id(&self) -> &'static str {
        "kitsu"
    }

    fn name(&self) -> &'static str {
        "Kitsu"
    }

    fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    async fn verify_authenticated(&self) -> Result<(), TrackerError> {
        self.current_user().await.map(|_| ())
    }

    async fn generate_token(&self, credentials: &Credentials) -> Result<(), TrackerError> {
        let Credentials::Password { username, password } = credentials else {
            return Err(TrackerError::Unsupported("authorization code login"));
        };

        let response = self
            .client
            .post(format!("{}/api/oauth/token", self.base_url))
            .form(&[
                ("grant_type", "password"),
                ("username", username.as_str()),
                ("password", password.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED
        ) {
            return Err(TrackerError::ApiError("invalid username or password".to_string()));
        }

        let token: TokenResponse = response
            .error_for_status()?
            .json()
            .await
            .map_err(|e| TrackerError::ParseError(e.to_string()))?;
        self.set_token(Some(token.access_token));
        tracing::info!(username = %username, "Authenticated with Kitsu");
        Ok(())
    }

    async fn authenticated_user_name(&self) -> Result<String, TrackerError> {
        Ok(self.current_user().await?.attributes.name)
    }

    async fn chapters_read(&self, media_id: &str) -> Result<u32, TrackerError> {
        Ok(self
            .library_entry(media_id)
            .await?
            .map_or(0, |entry| entry.progress))
    }

    async fn set_chapters_read(&self, media_id: &str, count: u32) -> Result<(), TrackerError> {
        let (request, body) = match self.library_entry(media_id).await? {
            Some(entry) => (
                self.client.patch(format!(
                    "{}/api/edge/library-entries/{}",
                    self.base_url, entry.id
                )),
                json!({
                    "data": {
                        "type": "libraryEntries",
                        "id": entry.id,
                        "attributes": { "progress": count },
                    }
                }),
            ),
            None => {
                let user_id = self.user_id().await?;
                (
                    self.client
                        .post(format!("{}/api/edge/library-entries", self.base_url)),
                    json!({
                        "data": {
                            "type": "libraryEntries",
                            "attributes": { "status": "current", "progress": count },
                            "relationships": {
                                "user": { "data": { "type": "users", "id": user_id } },
                                "media": { "data": { "type": "manga", "id": media_id } },
                            },
                        }
                    }),
                )
            }
        };

        let response = request
            .bearer_auth(self.token()?)
            .header(CONTENT_TYPE, JSON_API)
            .body(body.to_string())
            .send()
            .await?;
        self.check(response)?;
        tracing::debug!(media_id, count, "Updated Kitsu progress");
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
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tracker(server: &MockServer, token: Option<&str>) -> Kitsu {
        let credentials = TrackerCredentials {
            client_id: "id".to_string(),
            client_secret: "secret".to_string(),
            access_token: token.map(str::to_string),
        };
        Kitsu::with_base_url(&NetworkConfig::default(), &credentials, &server.uri()).unwrap()
    }

    async fn mount_user(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/api/edge/users"))
            .and(query_param("filter[self]", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "id": "7", "attributes": { "name": "reader" } }]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_password_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/oauth/token"))
            .and(body_string_contains("grant_type=password"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "access_token": "abc" })),
            )
            .mount(&server)
            .await;
        mount_user(&server).await;

        let kitsu = tracker(&server, None);
        assert!(!kitsu.is_authenticated());
        kitsu
            .generate_token(&Credentials::Password {
                username: "reader".to_string(),
                password: "pw".to_string(),
            })
            .await
            .unwrap();
        assert!(kitsu.is_authenticated());
        assert_eq!(kitsu.access_token().as_deref(), Some("abc"));
        assert_eq!(kitsu.authenticated_user_name().await.unwrap(), "reader");
    }

    #[tokio::test]
    async fn test_bad_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/oauth/token"))
            .respond_with(ResponseTemplate::new(400))
            .mount(&server)
            .await;

        let kitsu = tracker(&server, None);
        let result = kitsu
            .generate_token(&Credentials::Password {
                username: "reader".to_string(),
                password: "wrong".to_string(),
            })
            .await;
        assert!(matches!(result, Err(TrackerError::ApiError(_))));
        assert!(!kitsu.is_authenticated());
    }

    #[tokio::test]
    async fn test_progress_never_decreases() {
        let server = MockServer::start().await;
        mount_user(&server).await;
        Mock::given(method("GET"))
            .and(path("/api/edge/library-entries"))
            .and(query_param("filter[mangaId]", "99"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "id": "42", "attributes": { "progress": 7 } }]
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/edge/library-entries/42"))
            .and(body_string_contains("\"progress\":9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let kitsu = tracker(&server, Some("abc"));
        assert_eq!(
            kitsu.update_chapters_read("99", 5).await.unwrap(),
            ProgressUpdate::Unchanged { current: 7 }
        );
        assert_eq!(
            kitsu.update_chapters_read("99", 9).await.unwrap(),
            ProgressUpdate::Advanced { from: 7, to: 9 }
        );
    }

    #[tokio::test]
    async fn test_rejected_token_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/edge/users"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let kitsu = tracker(&server, Some("stale"));
        assert!(kitsu.is_authenticated());
        assert!(matches!(
            kitsu.verify_authenticated().await,
            Err(TrackerError::Unauthenticated)
        ));
        assert!(!kitsu.is_authenticated());
    }

    #[tokio::test]
    async fn test_code_flow_unsupported() {
        let server = MockServer::start().await;
        let kitsu = tracker(&server, None);
        let err = kitsu
            .generate_token(&Credentials::Code("xyz".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.classify(), crate::error::Failure::Unsupported);
    }
}
