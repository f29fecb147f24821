//! HTTP client of the remote store
//!
//! The store exports the daily statistics of a partition as gzipped TSV,
//! with a header row naming the [`Row`] fields.

use super::{Row, SourceError, TimeseriesSource};
use crate::{config::Connection, Date, Ngram, Partition};
use async_compression::tokio::bufread::GzipDecoder;
use csv_async::AsyncReaderBuilder;
use futures::stream::StreamExt;
use reqwest::StatusCode;
use std::io::{self, ErrorKind};
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;

/// Remote store reached over HTTP
#[derive(Clone, Debug)]
pub struct HttpSource {
    /// Shared HTTP client
    client: reqwest::Client,

    /// Where the store is and how to authenticate
    connection: Connection,
}
//
impl HttpSource {
    /// Prepare to query a remote store
    pub fn new(connection: Connection) -> Self {
        Self {
            client: reqwest::Client::new(),
            connection,
        }
    }

    /// URL of a partition's export
    fn url(&self, partition: &Partition) -> Box<str> {
        format!(
            "{}/{}/{}grams",
            self.connection.endpoint.trim_end_matches('/'),
            partition.language,
            partition.ngram_size
        )
        .into()
    }

    /// Download the rows of some n-grams in a single request
    async fn download(
        &self,
        url: &str,
        ngrams: &[Ngram],
        start: Date,
    ) -> Result<Vec<Row>, SourceError> {
        // Start the download
        let mut query = vec![("start", start.to_string())];
        query.extend(ngrams.iter().map(|ngram| ("ngram", ngram.to_string())));
        let mut request = self.client.get(url).query(&query);
        if let Some(user) = &self.connection.user {
            request = request.basic_auth(user, self.connection.password.as_deref());
        }
        let request_error = |source| SourceError::Request {
            url: url.into(),
            source,
        };
        let response = request.send().await.map_err(request_error)?;
        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return Err(SourceError::Unavailable(
                format!("{url} is temporarily out of service").into(),
            ));
        }
        let response = response.error_for_status().map_err(request_error)?;

        // Slice the download into chunks of bytes, translating reqwest errors
        // into I/O errors
        let gz_bytes = StreamReader::new(
            response
                .bytes_stream()
                .map(|res| res.map_err(|e| io::Error::new(ErrorKind::Other, Box::new(e)))),
        );
        decode(gz_bytes, url).await
    }
}
//
impl TimeseriesSource for HttpSource {
    async fn query(
        &self,
        partition: &Partition,
        ngrams: &[Ngram],
        start: Date,
    ) -> Result<Vec<Row>, SourceError> {
        let url = self.url(partition);
        let mut rows = Vec::new();
        for chunk in query_chunks(ngrams) {
            rows.extend(self.download(&url, chunk, start).await?);
        }
        log::debug!(
            "Received {} rows about {} n-grams of {partition} from {url}",
            rows.len(),
            ngrams.len()
        );
        Ok(rows)
    }
}

/// Upper bound on the n-gram part of a request's query string, in bytes
const MAX_QUERY_BYTES: usize = 4096;

/// Split n-grams into groups that each fit in one request
///
/// Sizes are estimated with every byte percent-encoded. An n-gram that does
/// not fit on its own still gets a request.
fn query_chunks(ngrams: &[Ngram]) -> Vec<&[Ngram]> {
    let mut chunks = Vec::new();
    let mut chunk_start = 0;
    let mut chunk_bytes = 0;
    for (idx, ngram) in ngrams.iter().enumerate() {
        let bytes = "&ngram=".len() + 3 * ngram.len();
        if idx > chunk_start && chunk_bytes + bytes > MAX_QUERY_BYTES {
            chunks.push(&ngrams[chunk_start..idx]);
            chunk_start = idx;
            chunk_bytes = 0;
        }
        chunk_bytes += bytes;
    }
    if chunk_start < ngrams.len() {
        chunks.push(&ngrams[chunk_start..]);
    }
    chunks
}

/// Decode a gzipped TSV export into rows
async fn decode(
    gz_bytes: impl AsyncBufRead + Unpin + Send,
    url: &str,
) -> Result<Vec<Row>, SourceError> {
    // Apply gzip then TSV decoders
    let tsv_bytes = GzipDecoder::new(gz_bytes);
    let mut rows = AsyncReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .create_deserializer(tsv_bytes)
        .into_deserialize::<Row>();

    // Collect the rows
    let mut result = Vec::new();
    while let Some(row) = rows.next().await {
        let row = row.map_err(|source| SourceError::Decode {
            url: url.into(),
            source,
        })?;
        log::trace!("Received {row:?} from {url}");
        result.push(row);
    }
    Ok(result)
}
