//! Stripe source adapter.
//!
//! Stripe has no metric-discovery API, so the catalog is fixed: balance
//! snapshots plus per-day charge and customer aggregates computed from the
//! list endpoints. All amounts arrive in minor units (cents) and are
//! converted to major units here, before anything downstream sees them.

use super::{AccountInfo, Provider, ProviderError, RawPoint, RawValue, ScopeInfo, SourceAdapter};
use crate::credentials::Credentials;
use crate::metrics::{DateRange, MetricDefinition, MetricKind};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use serde::Deserialize;

const API_BASE: &str = "https://api.stripe.com";
const PAGE_LIMIT: usize = 100;

pub struct StripeAdapter {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct Account {
    id: String,
    #[serde(default)]
    business_profile: Option<BusinessProfile>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Deserialize)]
struct BusinessProfile {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct Balance {
    #[serde(default)]
    available: Vec<BalanceAmount>,
    #[serde(default)]
    pending: Vec<BalanceAmount>,
}

#[derive(Deserialize)]
struct BalanceAmount {
    amount: i64,
}

#[derive(Deserialize)]
struct List<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Deserialize)]
struct Charge {
    id: String,
    amount: i64,
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct Customer {
    id: String,
}

/// Convert a Stripe minor-unit amount (cents) to major units.
fn minor_to_major(amount: i64) -> f64 {
    amount as f64 / 100.0
}

fn day_window(date: NaiveDate) -> (i64, i64) {
    let start = date.and_time(NaiveTime::MIN).and_utc().timestamp();
    (start, start + 86_400)
}

impl StripeAdapter {
    pub fn new() -> Self {
        Self::with_base_url(API_BASE)
    }

    /// Adapter pointed at a custom API root (tests use a mock server).
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        credentials: &Credentials,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&credentials.access_token)
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        Ok(response.json().await?)
    }

    /// List every charge created within a one-day window, following
    /// `has_more` pagination.
    async fn charges_for_day(
        &self,
        credentials: &Credentials,
        date: NaiveDate,
    ) -> Result<Vec<Charge>, ProviderError> {
        let (start, end) = day_window(date);
        let mut charges: Vec<Charge> = Vec::new();
        let mut starting_after: Option<String> = None;

        loop {
            let mut query = vec![
                ("created[gte]", start.to_string()),
                ("created[lt]", end.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(cursor) = &starting_after {
                query.push(("starting_after", cursor.clone()));
            }

            let page: List<Charge> = self
                .get_json(credentials, "/v1/charges", &query)
                .await?;
            let has_more = page.has_more;
            let cursor = page.data.last().map(|c| c.id.clone());
            charges.extend(page.data);

            // An empty page cannot advance the cursor; stop even if the
            // server claims more
            match cursor {
                Some(id) if has_more => starting_after = Some(id),
                _ => return Ok(charges),
            }
        }
    }

    async fn customers_for_day(
        &self,
        credentials: &Credentials,
        date: NaiveDate,
    ) -> Result<usize, ProviderError> {
        let (start, end) = day_window(date);
        let mut count = 0usize;
        let mut last_id: Option<String> = None;

        loop {
            let mut query = vec![
                ("created[gte]", start.to_string()),
                ("created[lt]", end.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
            ];
            if let Some(cursor) = &last_id {
                query.push(("starting_after", cursor.clone()));
            }

            let page: List<Customer> = self
                .get_json(credentials, "/v1/customers", &query)
                .await?;
            count += page.data.len();

            match page.data.last() {
                Some(last) if page.has_more => last_id = Some(last.id.clone()),
                _ => return Ok(count),
            }
        }
    }

    async fn total_customers(&self, credentials: &Credentials) -> Result<usize, ProviderError> {
        let mut count = 0usize;
        let mut last_id: Option<String> = None;

        loop {
            let mut query = vec![("limit", PAGE_LIMIT.to_string())];
            if let Some(cursor) = &last_id {
                query.push(("starting_after", cursor.clone()));
            }

            let page: List<Customer> = self
                .get_json(credentials, "/v1/customers", &query)
                .await?;
            count += page.data.len();

            match page.data.last() {
                Some(last) if page.has_more => last_id = Some(last.id.clone()),
                _ => return Ok(count),
            }
        }
    }
}

impl Default for StripeAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SourceAdapter for StripeAdapter {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    async fn account_info(&self, credentials: &Credentials) -> Result<AccountInfo, ProviderError> {
        let account: Account = self
            .get_json(credentials, "/v1/account", &[])
            .await?;

        let display_name = account
            .business_profile
            .and_then(|p| p.name)
            .or(account.email)
            .unwrap_or_else(|| account.id.clone());

        Ok(AccountInfo {
            id: account.id,
            display_name,
        })
    }

    async fn list_scopes(&self, credentials: &Credentials) -> Result<Vec<ScopeInfo>, ProviderError> {
        // A Stripe connection is exactly one account; it is its own scope.
        let info = self.account_info(credentials).await?;
        Ok(vec![ScopeInfo {
            id: info.id,
            display_name: info.display_name.clone(),
            account_name: info.display_name,
        }])
    }

    async fn list_metrics(
        &self,
        _credentials: &Credentials,
        _scope_id: &str,
    ) -> Result<Vec<MetricDefinition>, ProviderError> {
        Ok(vec![
            MetricDefinition::new(
                "available_balance",
                "Balance available for payout",
                MetricKind::Monetary,
            ),
            MetricDefinition::new(
                "pending_balance",
                "Balance pending settlement",
                MetricKind::Monetary,
            ),
            MetricDefinition::new(
                "daily_charges_count",
                "Successful charges created this day",
                MetricKind::Count,
            ),
            MetricDefinition::new(
                "daily_charges_volume",
                "Gross volume of successful charges this day",
                MetricKind::Monetary,
            ),
            MetricDefinition::new(
                "daily_failed_charges",
                "Failed charges created this day",
                MetricKind::Count,
            ),
            MetricDefinition::new(
                "daily_new_customers",
                "Customers created this day",
                MetricKind::Count,
            ),
            MetricDefinition::new(
                "total_customers",
                "Total customers on the account",
                MetricKind::Count,
            ),
        ])
    }

    async fn fetch_metric(
        &self,
        credentials: &Credentials,
        _scope_id: &str,
        definition: &MetricDefinition,
        range: &DateRange,
    ) -> Result<Vec<RawPoint>, ProviderError> {
        match definition.name.as_str() {
            // Balances are point-in-time snapshots; Stripe keeps no history,
            // so they attach to the most recent date of the range.
            "available_balance" | "pending_balance" => {
                let balance: Balance = self
                    .get_json(credentials, "/v1/balance", &[])
                    .await?;
                let amounts = if definition.name == "available_balance" {
                    balance.available
                } else {
                    balance.pending
                };
                let total: i64 = amounts.iter().map(|a| a.amount).sum();
                Ok(vec![RawPoint {
                    date: range.end,
                    value: RawValue::Float(minor_to_major(total)),
                }])
            }
            "daily_charges_count" | "daily_charges_volume" | "daily_failed_charges" => {
                let mut points = Vec::with_capacity(range.num_days() as usize);
                for date in range.iter_days() {
                    let charges = self.charges_for_day(credentials, date).await?;
                    let value = match definition.name.as_str() {
                        "daily_charges_count" => RawValue::Int(
                            charges.iter().filter(|c| c.status == "succeeded").count() as i64,
                        ),
                        "daily_failed_charges" => RawValue::Int(
                            charges.iter().filter(|c| c.status == "failed").count() as i64,
                        ),
                        _ => {
                            let volume: i64 = charges
                                .iter()
                                .filter(|c| c.status == "succeeded")
                                .map(|c| c.amount)
                                .sum();
                            RawValue::Float(minor_to_major(volume))
                        }
                    };
                    points.push(RawPoint { date, value });
                }
                Ok(points)
            }
            "daily_new_customers" => {
                let mut points = Vec::with_capacity(range.num_days() as usize);
                for date in range.iter_days() {
                    let count = self.customers_for_day(credentials, date).await?;
                    points.push(RawPoint {
                        date,
                        value: RawValue::Int(count as i64),
                    });
                }
                Ok(points)
            }
            "total_customers" => {
                let count = self.total_customers(credentials).await?;
                Ok(vec![RawPoint {
                    date: range.end,
                    value: RawValue::Int(count as i64),
                }])
            }
            other => Err(ProviderError::Api {
                status: 400,
                message: format!("unknown Stripe metric: {other}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn test_credentials() -> Credentials {
        Credentials {
            access_token: "sk_test_token".to_string(),
            refresh_token: Some("rt_test".to_string()),
            account_id: Some("acct_123".to_string()),
            account_name: Some("Acme".to_string()),
            token_uri: "https://connect.stripe.com/oauth/token".to_string(),
            scopes: vec!["read_write".to_string()],
        }
    }

    fn day(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn test_balance_converted_to_major_units() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/balance")
            .match_header("authorization", "Bearer sk_test_token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"available": [{"amount": 250}], "pending": [{"amount": 1000}, {"amount": 50}]}"#,
            )
            .expect(2)
            .create_async()
            .await;

        let adapter = StripeAdapter::with_base_url(&server.url());
        let range = DateRange::single(day("2024-03-09"));
        let metrics = adapter
            .list_metrics(&test_credentials(), "acct_123")
            .await
            .unwrap();

        let available = metrics.iter().find(|m| m.name == "available_balance").unwrap();
        let points = adapter
            .fetch_metric(&test_credentials(), "acct_123", available, &range)
            .await
            .unwrap();
        // 250 cents stores as 2.50
        assert_eq!(points, vec![RawPoint {
            date: day("2024-03-09"),
            value: RawValue::Float(2.5),
        }]);

        let pending = metrics.iter().find(|m| m.name == "pending_balance").unwrap();
        let points = adapter
            .fetch_metric(&test_credentials(), "acct_123", pending, &range)
            .await
            .unwrap();
        assert_eq!(points[0].value, RawValue::Float(10.5));
    }

    #[tokio::test]
    async fn test_daily_charge_aggregates() {
        let mut server = mockito::Server::new_async().await;
        let (start, _) = day_window(day("2024-03-08"));
        server
            .mock("GET", "/v1/charges")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("created[gte]".into(), start.to_string()),
                Matcher::UrlEncoded("created[lt]".into(), (start + 86_400).to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{
                    "data": [
                        {"id": "ch_1", "amount": 1500, "status": "succeeded"},
                        {"id": "ch_2", "amount": 2500, "status": "succeeded"},
                        {"id": "ch_3", "amount": 900, "status": "failed"}
                    ],
                    "has_more": false
                }"#,
            )
            .expect(3)
            .create_async()
            .await;

        let adapter = StripeAdapter::with_base_url(&server.url());
        let range = DateRange::single(day("2024-03-08"));
        let creds = test_credentials();

        let count_def =
            MetricDefinition::new("daily_charges_count", "", MetricKind::Count);
        let points = adapter
            .fetch_metric(&creds, "acct_123", &count_def, &range)
            .await
            .unwrap();
        assert_eq!(points[0].value, RawValue::Int(2));

        let volume_def =
            MetricDefinition::new("daily_charges_volume", "", MetricKind::Monetary);
        let points = adapter
            .fetch_metric(&creds, "acct_123", &volume_def, &range)
            .await
            .unwrap();
        assert_eq!(points[0].value, RawValue::Float(40.0));

        let failed_def =
            MetricDefinition::new("daily_failed_charges", "", MetricKind::Count);
        let points = adapter
            .fetch_metric(&creds, "acct_123", &failed_def, &range)
            .await
            .unwrap();
        assert_eq!(points[0].value, RawValue::Int(1));
    }

    #[tokio::test]
    async fn test_charge_pagination() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/charges")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [{"id": "ch_1", "amount": 100, "status": "succeeded"}], "has_more": true}"#,
            )
            .create_async()
            .await;
        server
            .mock("GET", "/v1/charges")
            .match_query(Matcher::UrlEncoded("starting_after".into(), "ch_1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"data": [{"id": "ch_2", "amount": 200, "status": "succeeded"}], "has_more": false}"#,
            )
            .create_async()
            .await;

        let adapter = StripeAdapter::with_base_url(&server.url());
        let def = MetricDefinition::new("daily_charges_count", "", MetricKind::Count);
        let points = adapter
            .fetch_metric(
                &test_credentials(),
                "acct_123",
                &def,
                &DateRange::single(day("2024-03-08")),
            )
            .await
            .unwrap();

        assert_eq!(points[0].value, RawValue::Int(2));
    }

    #[tokio::test]
    async fn test_empty_page_with_has_more_terminates() {
        // Some list endpoints can answer has_more with an empty data array;
        // without a cursor to advance, re-requesting would loop forever.
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/customers")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": [{"id": "cus_1"}], "has_more": true}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/v1/customers")
            .match_query(Matcher::UrlEncoded("starting_after".into(), "cus_1".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"data": [], "has_more": true}"#)
            .expect(1)
            .create_async()
            .await;

        let adapter = StripeAdapter::with_base_url(&server.url());
        let def = MetricDefinition::new("daily_new_customers", "", MetricKind::Count);
        let points = adapter
            .fetch_metric(
                &test_credentials(),
                "acct_123",
                &def,
                &DateRange::single(day("2024-03-08")),
            )
            .await
            .unwrap();

        assert_eq!(points[0].value, RawValue::Int(1));
    }

    #[tokio::test]
    async fn test_account_info_prefers_business_name() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/account")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id": "acct_123", "business_profile": {"name": "Acme Inc"}, "email": "ops@acme.test"}"#,
            )
            .create_async()
            .await;

        let adapter = StripeAdapter::with_base_url(&server.url());
        let info = adapter.account_info(&test_credentials()).await.unwrap();
        assert_eq!(info.id, "acct_123");
        assert_eq!(info.display_name, "Acme Inc");
    }

    #[tokio::test]
    async fn test_revoked_key_maps_to_unauthorized() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/account")
            .with_status(401)
            .with_body(r#"{"error": {"type": "invalid_request_error"}}"#)
            .create_async()
            .await;

        let adapter = StripeAdapter::with_base_url(&server.url());
        let result = adapter.account_info(&test_credentials()).await;
        assert!(matches!(result, Err(ProviderError::Unauthorized)));
    }
}
