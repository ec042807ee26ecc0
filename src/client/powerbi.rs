//! Power BI REST query service
//!
//! Queries go to the dataset's `executeQueries` endpoint. A "session" is an
//! HTTP client carrying the authorization headers; it is checked by fetching
//! the dataset's metadata.

use super::Auth;
use crate::error::QueryError;
use crate::etl::{Connector, ResultSet, Session, Timeouts};
use base64::Engine;
use eyre::Result;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use std::collections::HashSet;
use url::Url;

pub const DEFAULT_URL: &str = "https://api.powerbi.com/v1.0/myorg";

/// Opens sessions against one dataset
#[derive(Clone, Debug)]
pub struct PowerBiConnector {
    url: Url,
    dataset: String,
    auth: Auth,
}

impl PowerBiConnector {
    pub fn new(url: Url, dataset: impl Into<String>, auth: Auth) -> Self {
        Self {
            url,
            dataset: dataset.into(),
            auth,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    /// `{url}/datasets/{dataset}`, keeping any path on the base URL
    pub fn dataset_url(&self) -> Result<Url> {
        let base = self.url.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{}/datasets/{}", base, self.dataset))?)
    }

    fn headers(&self) -> Result<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::ACCEPT, "application/json".parse()?);
        match &self.auth {
            Auth::Basic(username, password) => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                headers.append(
                    reqwest::header::AUTHORIZATION,
                    format!("Basic {}", credentials).parse()?,
                );
            }
            Auth::Bearer(token) => {
                headers.append(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", token).parse()?,
                );
            }
            Auth::None => {}
        }
        Ok(headers)
    }
}

impl std::fmt::Display for PowerBiConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (dataset: {})", self.url, self.dataset)
    }
}

impl Connector for PowerBiConnector {
    type Session = PowerBiSession;

    async fn open(&self, timeouts: &Timeouts) -> Result<PowerBiSession, QueryError> {
        let connection = |e: eyre::Report| QueryError::Connection(format!("{:#}", e));
        let headers = self.headers().map_err(connection)?;
        let dataset_url = self.dataset_url().map_err(connection)?;
        let query_url = Url::parse(&format!("{}/executeQueries", dataset_url))
            .map_err(|e| QueryError::Connection(e.to_string()))?;
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(timeouts.connect)
            .build()
            .map_err(|e| QueryError::Connection(e.to_string()))?;

        log::debug!("Opening session on {} with {} auth", self, self.auth);
        let session = PowerBiSession {
            client,
            dataset_url,
            query_url,
        };
        session.probe(timeouts).await?;
        Ok(session)
    }
}

/// An authenticated client bound to one dataset
#[derive(Debug)]
pub struct PowerBiSession {
    client: Client,
    dataset_url: Url,
    query_url: Url,
}

impl PowerBiSession {
    async fn probe(&self, timeouts: &Timeouts) -> Result<(), QueryError> {
        let response = self
            .client
            .get(self.dataset_url.clone())
            .timeout(timeouts.connect)
            .send()
            .await
            .map_err(|e| {
                QueryError::Connection(format!("failed to reach {}: {}", self.dataset_url, e))
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                QueryError::Connection(format!("authentication failed ({})", status))
            }
            _ => QueryError::Connection(format!("{}: {}", status, body)),
        })
    }
}

impl Session for PowerBiSession {
    async fn ping(&self, timeouts: &Timeouts) -> bool {
        match self.probe(timeouts).await {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Ping failed: {}", e);
                false
            }
        }
    }

    async fn query(&self, text: &str, timeouts: &Timeouts) -> Result<ResultSet, QueryError> {
        let body = json!({
            "queries": [{ "query": text }],
            "serializerSettings": { "includeNulls": true }
        });
        log::trace!("POST {}", self.query_url);

        let response = self
            .client
            .post(self.query_url.clone())
            .timeout(timeouts.command)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let payload: Value = response.json().await.map_err(transport_error)?;
        parse_response(&payload)
    }

    async fn close(self) -> Result<(), QueryError> {
        // Nothing to tear down remotely
        drop(self.client);
        Ok(())
    }
}

fn transport_error(e: reqwest::Error) -> QueryError {
    if e.is_timeout() {
        QueryError::Timeout(e.to_string())
    } else if e.is_connect() {
        QueryError::Connection(e.to_string())
    } else {
        QueryError::Execution(e.to_string())
    }
}

/// Map a non-success response to the failure it represents
pub fn status_error(status: StatusCode, body: String) -> QueryError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };
    match status {
        StatusCode::UNAUTHORIZED => QueryError::SessionExpired(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => QueryError::Timeout(message),
        StatusCode::BAD_REQUEST => QueryError::Rejected(message),
        _ => QueryError::Execution(message),
    }
}

/// `Sales[Amount]` and `[Amount]` both become `Amount`
pub fn normalize_column(key: &str) -> String {
    match (key.rfind('['), key.strip_suffix(']')) {
        (Some(open), Some(inner)) if open < inner.len() => inner[open + 1..].to_string(),
        _ => key.to_string(),
    }
}

/// Column names for a row's keys
///
/// Keys are shortened with [`normalize_column`] unless two keys would end up
/// with the same name, in which case those keep their qualified form.
pub fn column_names<S: AsRef<str>>(keys: &[S]) -> Vec<String> {
    let short: Vec<String> = keys.iter().map(|k| normalize_column(k.as_ref())).collect();
    let mut seen = HashSet::new();
    keys.iter()
        .zip(&short)
        .map(|(key, name)| {
            let clashes = short.iter().filter(|other| *other == name).count() > 1;
            let mut column = if clashes {
                key.as_ref().to_string()
            } else {
                name.clone()
            };
            let base = column.clone();
            let mut suffix = 2;
            while !seen.insert(column.clone()) {
                column = format!("{}_{}", base, suffix);
                suffix += 1;
            }
            column
        })
        .collect()
}

fn service_error(value: &Value) -> Option<String> {
    let error = value.get("error")?;
    let message = error
        .pointer("/pbi.error/details/0/detail/value")
        .or_else(|| error.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string());
    Some(message)
}

/// Turn an `executeQueries` payload into a result set
///
/// Columns follow the key order of the first row and are named by
/// [`column_names`]. Keys missing from later rows become nulls.
pub fn parse_response(payload: &Value) -> Result<ResultSet, QueryError> {
    if let Some(message) = service_error(payload) {
        return Err(QueryError::Execution(message));
    }
    let result = payload
        .pointer("/results/0")
        .ok_or_else(|| QueryError::Execution("response has no results".to_string()))?;
    if let Some(message) = service_error(result) {
        return Err(QueryError::Execution(message));
    }

    let rows = match result.pointer("/tables/0/rows").and_then(Value::as_array) {
        Some(rows) => rows,
        None => return Ok(ResultSet::default()),
    };
    let Some(first) = rows.first().and_then(Value::as_object) else {
        return Ok(ResultSet::default());
    };

    let keys: Vec<&String> = first.keys().collect();
    let columns = column_names(&keys);
    let rows = rows
        .iter()
        .map(|row| {
            keys.iter()
                .map(|k| row.get(k.as_str()).cloned().unwrap_or(Value::Null))
                .collect()
        })
        .collect();

    Ok(ResultSet::new(columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_url_keeps_base_path() {
        let connector = PowerBiConnector::new(
            Url::parse("https://api.powerbi.com/v1.0/myorg/").unwrap(),
            "abc-123",
            Auth::None,
        );
        assert_eq!(
            connector.dataset_url().unwrap().as_str(),
            "https://api.powerbi.com/v1.0/myorg/datasets/abc-123"
        );
    }

    #[test]
    fn test_headers() {
        let connector = PowerBiConnector::new(
            Url::parse(DEFAULT_URL).unwrap(),
            "ds",
            Auth::Basic("user".into(), "pass".into()),
        );
        let headers = connector.headers().unwrap();
        assert_eq!(
            headers.get(reqwest::header::AUTHORIZATION).unwrap(),
            "Basic dXNlcjpwYXNz"
        );

        let connector =
            PowerBiConnector::new(Url::parse(DEFAULT_URL).unwrap(), "ds", Auth::None);
        assert!(
            connector
                .headers()
                .unwrap()
                .get(reqwest::header::AUTHORIZATION)
                .is_none()
        );
    }

    #[test]
    fn test_normalize_column() {
        assert_eq!(normalize_column("Cases[AmountInEuro]"), "AmountInEuro");
        assert_eq!(normalize_column("[Total]"), "Total");
        assert_eq!(normalize_column("Plain"), "Plain");
        assert_eq!(normalize_column("Odd]"), "Odd]");
    }

    #[test]
    fn test_column_names_keep_qualified_form_on_clash() {
        assert_eq!(
            column_names(&["Sales[Amount]", "Returns[Amount]", "Sales[Id]"]),
            vec!["Sales[Amount]", "Returns[Amount]", "Id"]
        );
        assert_eq!(column_names(&["[Total]", "Total"]), vec!["[Total]", "Total"]);
    }

    #[test]
    fn test_parse_response_with_shared_column_name() {
        let payload = json!({
            "results": [{"tables": [{"rows": [
                {"Sales[Amount]": 1, "Returns[Amount]": 2}
            ]}]}]
        });
        let rs = parse_response(&payload).unwrap();
        assert_eq!(rs.columns, vec!["Sales[Amount]", "Returns[Amount]"]);
        assert_eq!(rs.rows, vec![vec![json!(1), json!(2)]]);
        assert_eq!(rs.sum_column("Sales[Amount]"), Some(1.0));
        assert_eq!(rs.sum_column("Returns[Amount]"), Some(2.0));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, String::new()),
            QueryError::SessionExpired(_)
        ));
        assert!(matches!(
            status_error(StatusCode::GATEWAY_TIMEOUT, String::new()),
            QueryError::Timeout(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "bad DAX".into()),
            QueryError::Rejected(m) if m.contains("bad DAX")
        ));
        assert!(matches!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR, String::new()),
            QueryError::Execution(_)
        ));
    }

    #[test]
    fn test_parse_response() {
        let payload = json!({
            "results": [{
                "tables": [{
                    "rows": [
                        { "Cases[Id]": 1, "Cases[Amount]": 10.5 },
                        { "Cases[Id]": 2 }
                    ]
                }]
            }]
        });
        let rs = parse_response(&payload).unwrap();
        assert_eq!(rs.columns, vec!["Id", "Amount"]);
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.rows[1][1], Value::Null);
    }

    #[test]
    fn test_parse_empty_and_error_responses() {
        let empty = json!({ "results": [{ "tables": [{ "rows": [] }] }] });
        assert!(parse_response(&empty).unwrap().is_empty());

        let failed = json!({ "results": [{ "error": { "message": "out of memory" } }] });
        assert_eq!(
            parse_response(&failed).unwrap_err(),
            QueryError::Execution("out of memory".into())
        );

        assert!(parse_response(&json!({})).is_err());
    }
}
