use std::io::{self, IoSlice, Write};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::error::ProcessorError;
use crate::ledger::models::PaymentSource;
use crate::processor::pool::{ConnectionPool, RESPONSE_HEAD_CAPACITY};
use crate::processor::PaymentProcessor;
use crate::wire::codec;
use crate::wire::io::{read_response, write_all_vectored, BodySink};

const PAYMENTS_PATH: &str = "/payments";

/// Submits payments to one processor over pooled keep-alive connections
pub struct ProcessorClient {
    source: PaymentSource,
    pool: Arc<ConnectionPool>,
    request_prefix: Vec<u8>,
}

impl ProcessorClient {
    pub fn new(source: PaymentSource, pool: Arc<ConnectionPool>, host: &str) -> Self {
        Self {
            source,
            pool,
            request_prefix: codec::post_request_prefix(PAYMENTS_PATH, host),
        }
    }
}

/// Request body without going through a serializer. Callers guarantee the
/// correlation id needs no JSON escaping.
pub fn write_payment_body(
    out: &mut Vec<u8>,
    correlation_id: &str,
    amount: Decimal,
    requested_at: DateTime<Utc>,
) {
    out.clear();
    // Writing into a Vec cannot fail
    let _ = write!(
        out,
        "{{\"correlationId\":\"{}\",\"amount\":{},\"requestedAt\":\"{}\"}}",
        correlation_id,
        amount,
        requested_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    );
}

fn classify(error: io::Error) -> ProcessorError {
    if error.kind() == io::ErrorKind::InvalidData {
        ProcessorError::MalformedResponse(error.to_string())
    } else {
        ProcessorError::Io(error)
    }
}

#[async_trait]
impl PaymentProcessor for ProcessorClient {
    #[instrument(skip(self, amount, requested_at), fields(processor = ?self.source))]
    async fn process(
        &self,
        correlation_id: &str,
        amount: Decimal,
        requested_at: DateTime<Utc>,
    ) -> Result<(), ProcessorError> {
        let mut lease = self.pool.borrow().await?;
        let conn = &mut *lease;

        write_payment_body(&mut conn.body, correlation_id, amount, requested_at);
        let length = codec::encode_decimal(conn.body.len(), &mut conn.digits);
        let mut request = [
            IoSlice::new(&self.request_prefix),
            IoSlice::new(length),
            IoSlice::new(codec::HEADER_TERMINATOR),
            IoSlice::new(&conn.body),
        ];
        write_all_vectored(&mut conn.stream, &mut request)
            .await
            .map_err(classify)?;

        let response = read_response(
            &mut conn.stream,
            &mut conn.head,
            RESPONSE_HEAD_CAPACITY,
            BodySink::Discard(&mut conn.drain),
        )
        .await
        .map_err(classify)?;

        // Body fully drained: the connection can serve the next payment
        lease.release();

        if response.status != 200 {
            debug!("Processor rejected {} with {}", correlation_id, response.status);
            return Err(ProcessorError::Status(response.status));
        }
        Ok(())
    }

    fn source(&self) -> PaymentSource {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Endpoint;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Processor stub that records every request and answers with `status_line`
    async fn fake_processor(
        status_line: &'static str,
    ) -> (Endpoint, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let Some(end) = codec::find_header_end(&buf) else {
                            match stream.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                            continue;
                        };
                        let length = codec::parse_content_length(&buf[..end]).unwrap_or(0);
                        let total = end + 4 + length;
                        while buf.len() < total {
                            match stream.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                        }
                        let request: Vec<u8> = buf.drain(..total).collect();
                        let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
                        let response = format!("{}\r\nContent-Length: 2\r\n\r\nok", status_line);
                        if stream.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (endpoint, rx)
    }

    fn requested_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-07-15T12:34:56.789Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_payment_body_shape() {
        let mut body = Vec::new();
        write_payment_body(&mut body, "abc-1", dec!(19.90), requested_at());
        assert_eq!(
            String::from_utf8(body).unwrap(),
            r#"{"correlationId":"abc-1","amount":19.90,"requestedAt":"2025-07-15T12:34:56.789Z"}"#
        );
    }

    #[tokio::test]
    async fn test_process_sends_framed_request_and_reuses_connection() {
        let (endpoint, mut requests) = fake_processor("HTTP/1.1 200 OK").await;
        let pool = ConnectionPool::new(endpoint, 1, Duration::from_millis(5));
        let client = ProcessorClient::new(PaymentSource::Main, pool.clone(), "localhost");

        client.process("abc-1", dec!(19.90), requested_at()).await.unwrap();
        client.process("abc-2", dec!(1), requested_at()).await.unwrap();

        let first = requests.recv().await.unwrap();
        assert!(first.starts_with("POST /payments HTTP/1.1\r\nHost: localhost\r\n"));
        assert!(first.contains("Content-Length: 81\r\n\r\n"));
        assert!(first.ends_with(r#""requestedAt":"2025-07-15T12:34:56.789Z"}"#));

        let second = requests.recv().await.unwrap();
        assert!(second.contains(r#""correlationId":"abc-2","amount":1,"#));
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_non_200_is_a_failure_but_keeps_connection() {
        let (endpoint, _requests) = fake_processor("HTTP/1.1 500 Internal Server Error").await;
        let pool = ConnectionPool::new(endpoint, 1, Duration::from_millis(5));
        let client = ProcessorClient::new(PaymentSource::Fallback, pool.clone(), "localhost");

        let err = client.process("abc-1", dec!(1), requested_at()).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Status(500)));
        assert_eq!(client.source(), PaymentSource::Fallback);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_surfaces_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 256];
                let _ = stream.read(&mut buf).await;
                // Hang up without answering
            }
        });

        let pool = ConnectionPool::new(endpoint, 1, Duration::from_millis(5));
        let client = ProcessorClient::new(PaymentSource::Main, pool, "localhost");

        let err = client.process("abc-1", dec!(1), requested_at()).await.unwrap_err();
        assert!(matches!(err, ProcessorError::Io(_)));
    }

    #[tokio::test]
    async fn test_garbage_status_line_is_malformed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = Endpoint::Tcp(listener.local_addr().unwrap().to_string());
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 256];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(b"SMTP ready\r\n\r\n").await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let pool = ConnectionPool::new(endpoint, 1, Duration::from_millis(5));
        let client = ProcessorClient::new(PaymentSource::Main, pool, "localhost");

        let err = client.process("abc-1", dec!(1), requested_at()).await.unwrap_err();
        assert!(matches!(err, ProcessorError::MalformedResponse(_)));
    }
}
