use std::time::Duration;

use cadence_core::config::CallbackConfig;
use tracing::{debug, warn};

use crate::context::CallContext;
use crate::error::HandlerError;
use crate::types::Payload;

/// HTTP callback handler mode: POSTs each payload as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct CallbackClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl CallbackClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    pub fn from_config(cfg: &CallbackConfig) -> Self {
        Self::new(cfg.url.clone(), Duration::from_secs(cfg.timeout_secs))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Any 2xx is success. Bounded by the shorter of the client timeout and
    /// the context deadline; cancellation aborts the request.
    pub async fn deliver(&self, ctx: &CallContext, payload: &Payload) -> Result<(), HandlerError> {
        ctx.check().map_err(|e| HandlerError::new(e.to_string()))?;
        let ctx = ctx.child(Some(self.timeout));
        let timeout = ctx.remaining().unwrap_or(self.timeout);

        let request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .timeout(timeout)
            .json(payload)
            .send();

        let resp = tokio::select! {
            resp = request => resp.map_err(|e| HandlerError::new(format!("callback request failed: {e}")))?,
            err = ctx.done() => return Err(HandlerError::new(err.to_string())),
        };

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %text, uid = %payload.uid, "callback rejected payload");
            return Err(HandlerError::new(format!(
                "callback returned {}",
                status.as_u16()
            )));
        }
        debug!(uid = %payload.uid, status = status.as_u16(), "callback delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> Payload {
        Payload {
            group_key: "billing".into(),
            uid: "invoice-1".into(),
            payload: b"hi".to_vec(),
        }
    }

    #[tokio::test]
    async fn posts_payload_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({"group": "billing", "uid": "invoice-1", "payload": "aGk="})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = CallbackClient::new(format!("{}/hook", server.uri()), Duration::from_secs(5));
        client.deliver(&CallContext::new(), &payload()).await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_a_handler_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .mount(&server)
            .await;

        let client = CallbackClient::new(server.uri(), Duration::from_secs(5));
        let err = client
            .deliver(&CallContext::new(), &payload())
            .await
            .unwrap_err();
        assert!(err.0.contains("503"), "{err}");
    }

    #[tokio::test]
    async fn slow_endpoint_hits_context_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let client = CallbackClient::new(server.uri(), Duration::from_secs(30));
        let ctx = CallContext::with_timeout(Duration::from_millis(100));
        assert!(client.deliver(&ctx, &payload()).await.is_err());
    }

    #[tokio::test]
    async fn unreachable_endpoint_fails() {
        let client = CallbackClient::new("http://127.0.0.1:9/none", Duration::from_secs(1));
        assert!(client
            .deliver(&CallContext::new(), &payload())
            .await
            .is_err());
    }
}
