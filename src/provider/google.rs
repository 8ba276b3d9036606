//! Google Analytics 4 source adapter.
//!
//! Talks to two APIs: the Admin API for account/property discovery and the
//! Data API for metric metadata and reports. Metrics are fetched one at a
//! time with a `date` dimension, so a single bad metric never poisons a
//! whole report.

use super::{AccountInfo, Provider, ProviderError, RawPoint, RawValue, ScopeInfo, SourceAdapter};
use crate::credentials::Credentials;
use crate::metrics::{DateRange, MetricDefinition, MetricKind};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

const ADMIN_API_BASE: &str = "https://analyticsadmin.googleapis.com/v1beta";
const DATA_API_BASE: &str = "https://analyticsdata.googleapis.com/v1beta";

pub struct GoogleAnalyticsAdapter {
    client: reqwest::Client,
    admin_base: String,
    data_base: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountSummariesResponse {
    #[serde(default)]
    account_summaries: Vec<AccountSummary>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountSummary {
    /// Resource name, e.g. "accountSummaries/123".
    #[serde(default)]
    account: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    property_summaries: Vec<PropertySummary>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PropertySummary {
    /// Resource name, e.g. "properties/123".
    property: String,
    #[serde(default)]
    display_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataResponse {
    #[serde(default)]
    metrics: Vec<MetricMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetricMetadata {
    api_name: String,
    #[serde(default)]
    description: String,
    #[serde(rename = "type", default)]
    metric_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunReportResponse {
    #[serde(default)]
    rows: Vec<ReportRow>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRow {
    #[serde(default)]
    dimension_values: Vec<ReportValue>,
    #[serde(default)]
    metric_values: Vec<ReportValue>,
}

#[derive(Deserialize)]
struct ReportValue {
    #[serde(default)]
    value: String,
}

impl GoogleAnalyticsAdapter {
    pub fn new() -> Self {
        Self::with_base_urls(ADMIN_API_BASE, DATA_API_BASE)
    }

    /// Adapter pointed at custom API roots (tests use mock servers).
    pub fn with_base_urls(admin_base: &str, data_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            admin_base: admin_base.trim_end_matches('/').to_string(),
            data_base: data_base.trim_end_matches('/').to_string(),
        }
    }

    async fn account_summaries(
        &self,
        credentials: &Credentials,
    ) -> Result<Vec<AccountSummary>, ProviderError> {
        let url = format!("{}/accountSummaries?pageSize=200", self.admin_base);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&credentials.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let parsed: AccountSummariesResponse = response.json().await?;
        Ok(parsed.account_summaries)
    }

    /// Map the Data API's declared metric type onto a storage kind. GA
    /// reports everything as strings; the type decides how we parse them.
    fn kind_for(metric_type: &str) -> MetricKind {
        match metric_type {
            "TYPE_INTEGER" | "METRIC_TYPE_UNSPECIFIED" | "" => MetricKind::Count,
            "TYPE_CURRENCY" => MetricKind::Monetary,
            // seconds, milliseconds, float, standard ratios
            _ => MetricKind::Measure,
        }
    }
}

impl Default for GoogleAnalyticsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for GoogleAnalyticsAdapter {
    fn provider(&self) -> Provider {
        Provider::GoogleAnalytics
    }

    async fn account_info(&self, credentials: &Credentials) -> Result<AccountInfo, ProviderError> {
        let summaries = self.account_summaries(credentials).await?;
        let first = summaries.into_iter().next().ok_or_else(|| {
            ProviderError::ScopeNotFound("no Google Analytics accounts visible".to_string())
        })?;

        Ok(AccountInfo {
            id: first.account,
            display_name: first.display_name,
        })
    }

    async fn list_scopes(&self, credentials: &Credentials) -> Result<Vec<ScopeInfo>, ProviderError> {
        let summaries = self.account_summaries(credentials).await?;

        let mut scopes = Vec::new();
        for summary in summaries {
            for property in summary.property_summaries {
                scopes.push(ScopeInfo {
                    id: property.property,
                    display_name: property.display_name,
                    account_name: summary.display_name.clone(),
                });
            }
        }

        Ok(scopes)
    }

    async fn list_metrics(
        &self,
        credentials: &Credentials,
        scope_id: &str,
    ) -> Result<Vec<MetricDefinition>, ProviderError> {
        // scope_id is the property resource name, e.g. "properties/123"
        let url = format!("{}/{}/metadata", self.data_base, scope_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&credentials.access_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let parsed: MetadataResponse = response.json().await?;
        Ok(parsed
            .metrics
            .into_iter()
            .map(|m| {
                let kind = Self::kind_for(&m.metric_type);
                MetricDefinition::new(m.api_name, m.description, kind)
            })
            .collect())
    }

    async fn fetch_metric(
        &self,
        credentials: &Credentials,
        scope_id: &str,
        definition: &MetricDefinition,
        range: &DateRange,
    ) -> Result<Vec<RawPoint>, ProviderError> {
        let url = format!("{}/{}:runReport", self.data_base, scope_id);
        let body = json!({
            "dimensions": [{ "name": "date" }],
            "metrics": [{ "name": definition.name }],
            "dateRanges": [{
                "startDate": range.start.format("%Y-%m-%d").to_string(),
                "endDate": range.end.format("%Y-%m-%d").to_string(),
            }],
            "keepEmptyRows": true,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&credentials.access_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        let parsed: RunReportResponse = response.json().await?;

        let mut points = Vec::with_capacity(parsed.rows.len());
        for row in parsed.rows {
            let Some(date_value) = row.dimension_values.first() else {
                continue;
            };
            // GA formats the date dimension as YYYYMMDD
            let date = match NaiveDate::parse_from_str(&date_value.value, "%Y%m%d") {
                Ok(d) => d,
                Err(_) => {
                    warn!(metric = %definition.name, raw = %date_value.value,
                        "Skipping report row with unparseable date");
                    continue;
                }
            };
            let Some(metric_value) = row.metric_values.first() else {
                continue;
            };
            points.push(RawPoint {
                date,
                value: RawValue::Text(metric_value.value.clone()),
            });
        }

        Ok(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::normalize;
    use crate::metrics::MetricValue;

    fn test_credentials() -> Credentials {
        Credentials {
            access_token: "ya29.test-token".to_string(),
            refresh_token: Some("1//refresh".to_string()),
            account_id: None,
            account_name: None,
            token_uri: "https://oauth2.googleapis.com/token".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/analytics.readonly".to_string()],
        }
    }

    #[tokio::test]
    async fn test_list_scopes_flattens_properties() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/accountSummaries?pageSize=200")
            .match_header("authorization", "Bearer ya29.test-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "accountSummaries": [{
                        "account": "accounts/100",
                        "displayName": "Acme",
                        "propertySummaries": [
                            {"property": "properties/1", "displayName": "Site"},
                            {"property": "properties/2", "displayName": "App"}
                        ]
                    }]
                }"#,
            )
            .create_async()
            .await;

        let adapter = GoogleAnalyticsAdapter::with_base_urls(&server.url(), &server.url());
        let scopes = adapter.list_scopes(&test_credentials()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(scopes.len(), 2);
        assert_eq!(scopes[0].id, "properties/1");
        assert_eq!(scopes[0].account_name, "Acme");
        assert_eq!(scopes[1].display_name, "App");
    }

    #[tokio::test]
    async fn test_list_metrics_maps_types() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/properties/1/metadata")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "metrics": [
                        {"apiName": "sessions", "description": "Sessions", "type": "TYPE_INTEGER"},
                        {"apiName": "averageSessionDuration", "description": "Avg duration", "type": "TYPE_SECONDS"},
                        {"apiName": "totalRevenue", "description": "Revenue", "type": "TYPE_CURRENCY"}
                    ]
                }"#,
            )
            .create_async()
            .await;

        let adapter = GoogleAnalyticsAdapter::with_base_urls(&server.url(), &server.url());
        let metrics = adapter
            .list_metrics(&test_credentials(), "properties/1")
            .await
            .unwrap();

        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics[0].kind, MetricKind::Count);
        assert_eq!(metrics[1].kind, MetricKind::Measure);
        assert_eq!(metrics[2].kind, MetricKind::Monetary);
    }

    #[tokio::test]
    async fn test_fetch_metric_parses_report_dates() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/properties/1:runReport")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "rows": [
                        {"dimensionValues": [{"value": "20240308"}], "metricValues": [{"value": "1234"}]},
                        {"dimensionValues": [{"value": "20240309"}], "metricValues": [{"value": "987"}]},
                        {"dimensionValues": [{"value": "garbage"}], "metricValues": [{"value": "1"}]}
                    ]
                }"#,
            )
            .create_async()
            .await;

        let adapter = GoogleAnalyticsAdapter::with_base_urls(&server.url(), &server.url());
        let definition = MetricDefinition::new("sessions", "Sessions", MetricKind::Count);
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 8).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(),
        );

        let points = adapter
            .fetch_metric(&test_credentials(), "properties/1", &definition, &range)
            .await
            .unwrap();

        // Row with the unparseable date is dropped, valid rows survive
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date, NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
        assert_eq!(points[0].value, RawValue::Text("1234".to_string()));
        assert_eq!(
            normalize(definition.kind, &points[0].value),
            MetricValue::Count(1234)
        );
    }

    #[tokio::test]
    async fn test_expired_token_maps_to_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/accountSummaries?pageSize=200")
            .with_status(401)
            .with_body(r#"{"error": {"status": "UNAUTHENTICATED"}}"#)
            .create_async()
            .await;

        let adapter = GoogleAnalyticsAdapter::with_base_urls(&server.url(), &server.url());
        let result = adapter.account_info(&test_credentials()).await;

        assert!(matches!(result, Err(ProviderError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_unknown_property_maps_to_scope_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/properties/999/metadata")
            .with_status(404)
            .with_body(r#"{"error": {"status": "NOT_FOUND"}}"#)
            .create_async()
            .await;

        let adapter = GoogleAnalyticsAdapter::with_base_urls(&server.url(), &server.url());
        let result = adapter
            .list_metrics(&test_credentials(), "properties/999")
            .await;

        assert!(matches!(result, Err(ProviderError::ScopeNotFound(_))));
    }
}
