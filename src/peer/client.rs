use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use url::form_urlencoded;

use crate::api::handler::SUMMARY_LOCK_PATH;
use crate::error::PeerError;
use crate::ledger::models::PaymentsSummary;
use crate::transport::Endpoint;
use crate::wire::codec;
use crate::wire::io::{read_response, BodySink};

const RESPONSE_HEAD_CAPACITY: usize = 1024;

/// Reads a sibling instance's local summary over its private socket
#[derive(Debug, Clone)]
pub struct PeerClient {
    endpoint: Endpoint,
}

impl PeerClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// One-shot `GET /payments-summary-lock` on a fresh connection.
    ///
    /// The peer pauses its own dispatch while answering.
    pub async fn get_summary(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<PaymentsSummary, PeerError> {
        let target = summary_lock_target(from, to);
        let mut stream = self.endpoint.connect().await?;
        stream
            .write_all(&codec::get_request(&target, "localhost"))
            .await?;
        stream.flush().await?;

        let mut head = Vec::with_capacity(RESPONSE_HEAD_CAPACITY);
        let mut body = Vec::new();
        let response = read_response(
            &mut stream,
            &mut head,
            RESPONSE_HEAD_CAPACITY,
            BodySink::Collect(&mut body),
        )
        .await?;

        if response.status != 200 {
            return Err(PeerError::Status(response.status));
        }

        let summary: PaymentsSummary = serde_json::from_slice(&body)?;
        debug!("🤝 Peer {} summary: {:?}", self.endpoint, summary);
        Ok(summary)
    }
}

fn summary_lock_target(from: DateTime<Utc>, to: DateTime<Utc>) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("from", &from.to_rfc3339_opts(SecondsFormat::Millis, true))
        .append_pair("to", &to.to_rfc3339_opts(SecondsFormat::Millis, true))
        .finish();
    format!("{}?{}", SUMMARY_LOCK_PATH, query)
}
