//! Google Sheets v4 transport over HTTPS.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use gcp_auth::TokenProvider;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sweep_core::error::{Error, Result};
use sweep_core::overlay::scalar_text;

use super::transport::{CellUpdate, SheetTransport, TransportResult, quote_title};
use crate::retry::TransportError;

const SHEETS_SCOPES: &[&str] = &["https://www.googleapis.com/auth/spreadsheets"];

/// Spreadsheet access through the Sheets REST API.
pub struct HttpSheetTransport {
    client: reqwest::Client,
    api_base: Url,
    spreadsheet_id: String,
    token_provider: Arc<dyn TokenProvider>,
}

// Manual Debug implementation since TokenProvider doesn't implement Debug
impl std::fmt::Debug for HttpSheetTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSheetTransport")
            .field("api_base", &self.api_base.as_str())
            .field("spreadsheet_id", &self.spreadsheet_id)
            .field("token_provider", &"<TokenProvider>")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetMeta>,
}

#[derive(Debug, Deserialize)]
struct SheetMeta {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchUpdateRequest<'a> {
    value_input_option: &'static str,
    data: Vec<CellRange<'a>>,
}

#[derive(Debug, Serialize)]
struct CellRange<'a> {
    range: String,
    values: [[&'a str; 1]; 1],
}

impl HttpSheetTransport {
    /// Creates a transport, loading credentials from a service-account key
    /// file or, when none is given, from the application default chain.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` for an unusable API base, and `BackendIo` if
    /// credentials cannot be loaded.
    pub async fn connect(
        api_base: &str,
        spreadsheet_id: &str,
        credentials_path: Option<&Path>,
    ) -> Result<Self> {
        let token_provider: Arc<dyn TokenProvider> = match credentials_path {
            Some(path) => Arc::new(gcp_auth::CustomServiceAccount::from_file(path).map_err(
                |e| {
                    Error::backend_io(format!(
                        "failed to load service account key {}: {e}",
                        path.display()
                    ))
                },
            )?),
            None => gcp_auth::provider()
                .await
                .map_err(|e| Error::backend_io(format!("failed to initialize GCP auth: {e}")))?,
        };
        Self::with_token_provider(api_base, spreadsheet_id, token_provider)
    }

    /// Creates a transport using an existing token provider.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` if `api_base` is not a valid base URL.
    pub fn with_token_provider(
        api_base: &str,
        spreadsheet_id: &str,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let api_base = Url::parse(api_base)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| Error::configuration(format!("invalid sheets API base: {api_base}")))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base,
            spreadsheet_id: spreadsheet_id.to_string(),
            token_provider,
        })
    }

    fn url(&self, tail: &[&str]) -> TransportResult<Url> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::Fatal("sheets API base cannot be a base".into()))?
            .pop_if_empty()
            .extend(["spreadsheets", self.spreadsheet_id.as_str()])
            .extend(tail);
        Ok(url)
    }

    async fn access_token(&self) -> TransportResult<String> {
        let token = self
            .token_provider
            .token(SHEETS_SCOPES)
            .await
            .map_err(|e| TransportError::Transient(format!("failed to get access token: {e}")))?;
        Ok(token.as_str().to_string())
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> TransportResult<T> {
        let token = self.access_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::from_status(status.as_u16(), &body));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| TransportError::Fatal(format!("unexpected sheets response: {e}")))
    }
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        TransportError::Transient(err.to_string())
    } else {
        TransportError::Fatal(err.to_string())
    }
}

#[async_trait]
impl SheetTransport for HttpSheetTransport {
    async fn worksheets(&self) -> TransportResult<Vec<String>> {
        let mut url = self.url(&[])?;
        url.query_pairs_mut()
            .append_pair("fields", "sheets.properties.title");
        let meta: SpreadsheetMeta = self.send(self.client.get(url)).await?;
        Ok(meta
            .sheets
            .into_iter()
            .map(|sheet| sheet.properties.title)
            .collect())
    }

    async fn read_values(&self, worksheet: &str) -> TransportResult<Vec<Vec<String>>> {
        let range = quote_title(worksheet);
        let url = self.url(&["values", range.as_str()])?;
        let values: ValueRange = self.send(self.client.get(url)).await?;
        Ok(values
            .values
            .iter()
            .map(|row| row.iter().map(scalar_text).collect())
            .collect())
    }

    async fn write_cells(&self, worksheet: &str, cells: &[CellUpdate]) -> TransportResult<()> {
        if cells.is_empty() {
            return Ok(());
        }
        let title = quote_title(worksheet);
        let body = BatchUpdateRequest {
            value_input_option: "RAW",
            data: cells
                .iter()
                .map(|cell| CellRange {
                    range: format!("{title}!{}", cell.a1()),
                    values: [[cell.value.as_str()]],
                })
                .collect(),
        };
        let url = self.url(&["values:batchUpdate"])?;
        let _: Value = self.send(self.client.post(url).json(&body)).await?;
        Ok(())
    }
}
