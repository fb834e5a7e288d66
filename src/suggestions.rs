//! HTTP client for the remote suggestion service.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use visit_core::{
    CollaboratorError, SuggestionChannel, SuggestionContext, SuggestionResult, SuggestionService,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SuggestionRequest<'a> {
    channel: &'a SuggestionChannel,
    input: &'a str,
    context: &'a SuggestionContext,
}

/// Posts `{channel, input, context}` as JSON to a single endpoint and decodes the
/// [`SuggestionResult`] it answers with.
#[derive(Clone)]
pub struct HttpSuggestionService {
    client: reqwest::Client,
    url: String,
}

impl HttpSuggestionService {
    pub fn new(url: impl Into<String>) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SuggestionService for HttpSuggestionService {
    async fn fetch_suggestions(
        &self,
        channel: &SuggestionChannel,
        input: &str,
        context: &SuggestionContext,
    ) -> Result<SuggestionResult, CollaboratorError> {
        let request = SuggestionRequest {
            channel,
            input,
            context,
        };

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(format!("suggestion service answered {status} for channel {channel}").into());
        }

        Ok(response.json::<SuggestionResult>().await?)
    }
}
