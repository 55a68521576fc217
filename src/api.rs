//! Token endpoints of the IM backend.
//!
//! [`TokenApi`] is the seam the session uses for every HTTP call; the
//! `http-api` feature provides [`HttpTokenApi`] on top of `reqwest`. All four
//! endpoints answer with the [`ApiResponse`](crate::protocol::ApiResponse)
//! envelope.

use async_trait::async_trait;

use crate::error::Result;

/// Path of the token-expiry check.
pub const CHECK_EXPIRY_PATH: &str = "im/checkWsTokenExpiry";
/// Path of the token renewal.
pub const RENEW_PATH: &str = "im/renewWsToken";
/// Path of the token regeneration.
pub const REGENERATE_PATH: &str = "im/getWsToken";
/// Path of the HTTP heartbeat.
pub const HEARTBEAT_PATH: &str = "im/heartbeat";

/// Backend calls that manage the WebSocket token.
#[async_trait]
pub trait TokenApi: Send + Sync + 'static {
    /// Minutes of validity left on `ws_token`.
    async fn check_expiry(&self, ws_token: &str) -> Result<i64>;

    /// Exchange a still-valid `old_token` for a fresh one.
    async fn renew(&self, old_token: &str) -> Result<String>;

    /// Issue a brand-new token from the long-lived `user_token`.
    async fn regenerate(&self, user_token: &str) -> Result<String>;

    /// Session-level heartbeat. May return a rotated token.
    async fn heartbeat(&self, ws_token: &str) -> Result<Option<String>>;
}

#[cfg(feature = "http-api")]
pub use http::HttpTokenApi;

#[cfg(feature = "http-api")]
mod http {
    use async_trait::async_trait;
    use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
    use reqwest::Client as ReqwestClient;
    use serde::de::DeserializeOwned;
    use url::Url;

    use super::{TokenApi, CHECK_EXPIRY_PATH, HEARTBEAT_PATH, REGENERATE_PATH, RENEW_PATH};
    use crate::error::Result;
    use crate::protocol::ApiResponse;

    /// [`TokenApi`] over HTTP.
    #[derive(Clone, Debug)]
    pub struct HttpTokenApi {
        base: Url,
        client: ReqwestClient,
    }

    impl HttpTokenApi {
        /// Client for the backend rooted at `base_url`
        /// (e.g. `https://example.com/api/`).
        ///
        /// # Errors
        ///
        /// Returns an error if the URL is invalid or the HTTP client fails to build.
        pub fn new(base_url: &str) -> Result<Self> {
            let mut headers = HeaderMap::new();
            headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
            let client = ReqwestClient::builder().default_headers(headers).build()?;
            Self::with_client(base_url, client)
        }

        /// Like [`new`](Self::new) with a caller-configured `reqwest` client.
        ///
        /// # Errors
        ///
        /// Returns an error if the URL is invalid.
        pub fn with_client(base_url: &str, client: ReqwestClient) -> Result<Self> {
            let mut base = Url::parse(base_url)?;
            if !base.path().ends_with('/') {
                let path = format!("{}/", base.path());
                base.set_path(&path);
            }
            Ok(Self { base, client })
        }

        /// Base URL every endpoint path is joined onto.
        pub fn base_url(&self) -> &Url {
            &self.base
        }

        async fn get<T: DeserializeOwned>(
            &self,
            path: &str,
            query: &[(&str, &str)],
            authorization: Option<&str>,
        ) -> Result<ApiResponse<T>> {
            let url = self.base.join(path)?;
            let mut request = self.client.get(url).query(query);
            if let Some(authorization) = authorization {
                request = request.header(AUTHORIZATION, authorization);
            }
            let response = request.send().await?.error_for_status()?;
            let envelope = response.json::<ApiResponse<T>>().await?;
            tracing::trace!(path, code = envelope.code, "token api response");
            Ok(envelope)
        }
    }

    #[async_trait]
    impl TokenApi for HttpTokenApi {
        async fn check_expiry(&self, ws_token: &str) -> Result<i64> {
            self.get::<i64>(CHECK_EXPIRY_PATH, &[("wsToken", ws_token)], None)
                .await?
                .into_data()
        }

        async fn renew(&self, old_token: &str) -> Result<String> {
            self.get::<String>(RENEW_PATH, &[("oldToken", old_token)], None)
                .await?
                .into_data()
        }

        async fn regenerate(&self, user_token: &str) -> Result<String> {
            self.get::<String>(REGENERATE_PATH, &[], Some(user_token))
                .await?
                .into_data()
        }

        async fn heartbeat(&self, ws_token: &str) -> Result<Option<String>> {
            self.get::<String>(HEARTBEAT_PATH, &[("wsToken", ws_token)], None)
                .await?
                .into_optional_data()
        }
    }

    #[cfg(test)]
    #[allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing
    )]
    mod tests {
        use super::*;

        #[test]
        fn base_url_gets_trailing_slash() {
            let api = HttpTokenApi::new("http://localhost:8081/api").unwrap();
            assert_eq!(api.base_url().as_str(), "http://localhost:8081/api/");
            assert_eq!(
                api.base_url().join(RENEW_PATH).unwrap().as_str(),
                "http://localhost:8081/api/im/renewWsToken"
            );
        }

        #[test]
        fn invalid_base_url_is_rejected() {
            assert!(HttpTokenApi::new("not a url").is_err());
        }
    }
}
