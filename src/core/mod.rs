use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::bce::bos::BosClient;
use crate::bce::client::{self, HttpClient, Transport};
use crate::bce::headers::{HOST, X_BCE_SECURITY_TOKEN};
use crate::bce::signer::{BceSigner, SignOptions};
use crate::bce::types::{resource_path, BceRequest, Headers, Params, Response};
use crate::config::{ClientConfig, BOS_SERVICE_ID};
use crate::upload::Uploader;

/// Base client shared by every operation
///
/// Owns the configuration, the signer and one pooled [`HttpClient`]. Clones
/// share the same HTTP connection pool.
#[derive(Clone, Debug)]
pub struct Core {
    pub config: Arc<ClientConfig>,
    signer: BceSigner,
    http: HttpClient,
}

impl Core {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let endpoint = config.endpoint_for(BOS_SERVICE_ID);
        let http = HttpClient::new(
            &endpoint,
            config.credentials.clone(),
            config.connect_timeout(),
        )
        .context(format!("Failed to create HTTP client for {}", endpoint))?
        .with_timeout(config.request_timeout());

        tracing::info!(
            endpoint = %endpoint,
            access_key = %config.credentials.access_key,
            session = config.credentials.session_token.is_some(),
            "client_ready"
        );

        Ok(Self {
            config: Arc::new(config),
            signer: BceSigner::new(),
            http,
        })
    }

    /// Build from `BCE_*` environment variables (and `.env`)
    pub fn from_env() -> Result<Self> {
        let config = crate::config::load_from_env()?;
        let profile = config
            .get_profile(None)
            .ok_or_else(|| anyhow::anyhow!("No profile found in configuration"))?;
        Self::new(profile.clone())
    }

    pub fn endpoint(&self) -> &str {
        self.http.endpoint()
    }

    /// Object storage operations over this client
    pub fn bos(&self) -> BosClient<Core> {
        BosClient::new(self.clone())
    }

    /// Upload orchestrator using the configured multipart settings
    pub fn uploader(&self) -> Uploader<Core> {
        Uploader::new(self.bos()).with_config(self.config.multipart.clone())
    }

    /// Signed GET URL for an object.
    ///
    /// `host` is set from the endpoint and signed; the signature travels in
    /// the `authorization` query parameter.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_presigned_url(
        &self,
        bucket: &str,
        key: &str,
        timestamp: Option<DateTime<Utc>>,
        expiration_secs: Option<u64>,
        headers: Headers,
        params: Params,
        headers_to_sign: &[&str],
    ) -> client::Result<String> {
        let resource = resource_path(bucket, key);

        let mut headers: Headers = headers
            .into_iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v))
            .collect();
        headers.insert(HOST.to_string(), self.http.host().to_string());

        let mut params = params;
        if let Some(token) = &self.config.credentials.session_token {
            params.insert(X_BCE_SECURITY_TOKEN.to_string(), token.clone());
        }

        let mut options = SignOptions::default().with_headers_to_sign(headers_to_sign);
        if let Some(ts) = timestamp {
            options = options.with_timestamp(ts);
        }
        if let Some(secs) = expiration_secs {
            options = options.with_expiration(secs);
        }

        let authorization = self.signer.generate_authorization(
            &self.config.credentials,
            "GET",
            &resource,
            &params,
            &headers,
            &options,
        )?;
        params.insert("authorization".to_string(), authorization);

        Ok(self.http.request_url(&resource, &params))
    }
}

#[async_trait]
impl Transport for Core {
    /// Attach the session token, then sign and send through the pooled client.
    async fn send(&self, mut request: BceRequest) -> client::Result<Response> {
        if let Some(token) = &self.config.credentials.session_token {
            request
                .headers
                .insert(X_BCE_SECURITY_TOKEN.to_string(), token.clone());
        }
        self.http.execute(request, &self.signer).await
    }
}
