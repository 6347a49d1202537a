//! One pass through the life of a travel record: create a draft, fill it in, activate it, find
//! it, delete it and confirm that it is gone.
//!
//! Every step runs even when an earlier one failed, using whatever the earlier responses
//! returned. Failures show up as failed checks rather than as errors.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sso_squall_runner::prelude::{HttpClientInstrumented, HttpError, HttpRequest, HttpResponse, Url};

/// Path of the travel processor app below the application base URL.
pub const APP_ID: &str =
    "1f37942e-c1d7-471c-aedb-8b5081b63417.sapfecapsflight.sapfecaptravel/processor";

const DELETE_SETTLE_TIME: Duration = Duration::from_millis(500);

/// The outcome of one business assertion.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub label: &'static str,
    pub passed: bool,
}

impl CheckResult {
    fn new(label: &'static str, passed: bool) -> Self {
        Self { label, passed }
    }
}

/// The key fields of a travel entity as returned by the service.
#[derive(Debug, Default, Deserialize)]
struct TravelKey {
    #[serde(rename = "TravelUUID", default)]
    travel_uuid: String,
    #[serde(rename = "IsActiveEntity", default)]
    is_active_entity: bool,
    #[serde(rename = "TravelID", default)]
    travel_id: Value,
}

impl TravelKey {
    /// The business key as it appears in a `$filter`. Numbers and strings are written bare.
    fn travel_id(&self) -> String {
        match &self.travel_id {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    fn entity_path(&self) -> String {
        format!(
            "Travel(TravelUUID='{}',IsActiveEntity={})",
            self.travel_uuid, self.is_active_entity
        )
    }
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    #[serde(rename = "@odata.count")]
    count: Value,
}

/// Runs the travel draft lifecycle against an application under `base_url`.
pub struct TravelLifecycle<'a> {
    client: &'a mut HttpClientInstrumented,
    processor: Url,
}

impl<'a> TravelLifecycle<'a> {
    pub fn new(client: &'a mut HttpClientInstrumented, base_url: &Url) -> anyhow::Result<Self> {
        let processor = Url::parse(&format!(
            "{}/{APP_ID}/",
            base_url.as_str().trim_end_matches('/')
        ))?;

        Ok(Self { client, processor })
    }

    pub async fn run(mut self) -> Vec<CheckResult> {
        let mut checks = Vec::with_capacity(6);

        let created = self
            .send(HttpRequest::post(self.url("Travel")).name("create_draft"), &json!({}))
            .await;
        checks.push(CheckResult::new("Draft created", has_status(&created, 201)));
        let draft: TravelKey = body_or_default(&created);

        let updated = self
            .send(
                HttpRequest::patch(self.url(&draft.entity_path())).name("update_draft"),
                &draft_details(),
            )
            .await;
        checks.push(CheckResult::new("Draft updated", has_status(&updated, 200)));

        let activated = self
            .send(
                HttpRequest::post(
                    self.url(&format!("{}/TravelService.draftActivate", draft.entity_path())),
                )
                .name("activate_draft"),
                &json!({}),
            )
            .await;
        checks.push(CheckResult::new("Draft activated", has_status(&activated, 201)));
        let active: TravelKey = body_or_default(&activated);
        let travel = TravelKey {
            travel_uuid: draft.travel_uuid,
            is_active_entity: active.is_active_entity,
            travel_id: active.travel_id,
        };

        let found = self.count(&travel.travel_id()).await;
        checks.push(CheckResult::new("TravelID found", found == Some(1)));

        let deleted = self
            .client
            .send(HttpRequest::delete(self.url(&travel.entity_path())).name("delete_travel"))
            .await;
        log_failure(&deleted);
        checks.push(CheckResult::new("TravelID deleted", has_status(&deleted, 204)));

        tokio::time::sleep(DELETE_SETTLE_TIME).await;

        let remaining = self.count(&travel.travel_id()).await;
        checks.push(CheckResult::new(
            "TravelID deletion confirmed",
            remaining == Some(0),
        ));

        checks
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.processor)
    }

    async fn send(
        &mut self,
        request: HttpRequest,
        body: &Value,
    ) -> Result<HttpResponse, HttpError> {
        let result = match request.json(body) {
            Ok(request) => self.client.send(request).await,
            Err(e) => Err(e),
        };
        log_failure(&result);
        result
    }

    /// How many travels have the business key `travel_id`, read through the list endpoint.
    async fn count(&mut self, travel_id: &str) -> Option<i64> {
        let mut url = Url::parse(&self.url("Travel")).ok()?;
        url.set_query(Some(&format!(
            "$count=true&$filter=TravelID eq {travel_id}"
        )));

        let response = self
            .client
            .send(HttpRequest::get(url.as_str()).name("count_travel"))
            .await;
        log_failure(&response);

        let count = response.ok()?.json::<CountResponse>().ok()?.count;
        match count {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

/// Fields that turn an empty draft into a travel that can be activated.
fn draft_details() -> Value {
    let begin = Utc::now().date_naive();
    let end = begin + chrono::Days::new(7);

    json!({
        "to_Agency_AgencyID": "070006",
        "to_Customer_CustomerID": "000001",
        "Description": "Travel for deletion",
        "BookingFee": "50",
        "CurrencyCode_code": "USD",
        "BeginDate": begin.format("%Y-%m-%d").to_string(),
        "EndDate": end.format("%Y-%m-%d").to_string(),
    })
}

fn has_status(response: &Result<HttpResponse, HttpError>, status: u16) -> bool {
    matches!(response, Ok(r) if r.status.as_u16() == status)
}

fn body_or_default<T: Default + serde::de::DeserializeOwned>(
    response: &Result<HttpResponse, HttpError>,
) -> T {
    response
        .as_ref()
        .ok()
        .and_then(|r| r.json().ok())
        .unwrap_or_default()
}

fn log_failure(response: &Result<HttpResponse, HttpError>) {
    if let Err(e) = response {
        log::warn!("Request failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sso_squall_runner::prelude::{build_client, MetricsCollector};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn processor_path(rest: &str) -> String {
        format!("/{APP_ID}/{rest}")
    }

    async fn mount_travel_service(server: &MockServer, activation_status: u16) {
        Mock::given(method("POST"))
            .and(path(processor_path("Travel")))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "TravelUUID": "6a1f0c7e",
                "IsActiveEntity": false,
                "TravelID": 0
            })))
            .mount(server)
            .await;

        Mock::given(method("PATCH"))
            .and(path(processor_path(
                "Travel(TravelUUID='6a1f0c7e',IsActiveEntity=false)",
            )))
            .and(body_partial_json(json!({
                "to_Agency_AgencyID": "070006",
                "BookingFee": "50",
                "CurrencyCode_code": "USD"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path(processor_path(
                "Travel(TravelUUID='6a1f0c7e',IsActiveEntity=false)/TravelService.draftActivate",
            )))
            .respond_with(ResponseTemplate::new(activation_status).set_body_json(json!({
                "TravelUUID": "6a1f0c7e",
                "IsActiveEntity": true,
                "TravelID": 4133
            })))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path(processor_path("Travel")))
            .and(query_param("$count", "true"))
            .and(query_param("$filter", "TravelID eq 4133"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"@odata.count": 1, "value": []})),
            )
            .up_to_n_times(1)
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path(processor_path("Travel")))
            .and(query_param("$filter", "TravelID eq 4133"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"@odata.count": 0, "value": []})),
            )
            .mount(server)
            .await;

        Mock::given(method("DELETE"))
            .and(path(processor_path(
                "Travel(TravelUUID='6a1f0c7e',IsActiveEntity=true)",
            )))
            .respond_with(ResponseTemplate::new(204))
            .mount(server)
            .await;
    }

    fn client() -> HttpClientInstrumented {
        HttpClientInstrumented::new(
            build_client(Duration::from_secs(5)).unwrap(),
            Arc::new(MetricsCollector::with_builtin_metrics()),
        )
    }

    fn failed(checks: &[CheckResult]) -> Vec<&'static str> {
        checks.iter().filter(|c| !c.passed).map(|c| c.label).collect()
    }

    #[tokio::test]
    async fn full_lifecycle_passes_every_check() {
        let server = MockServer::start().await;
        mount_travel_service(&server, 201).await;
        let mut client = client();
        let base_url = Url::parse(&server.uri()).unwrap();

        let checks = TravelLifecycle::new(&mut client, &base_url)
            .unwrap()
            .run()
            .await;

        assert_eq!(
            checks.iter().map(|c| c.label).collect::<Vec<_>>(),
            vec![
                "Draft created",
                "Draft updated",
                "Draft activated",
                "TravelID found",
                "TravelID deleted",
                "TravelID deletion confirmed"
            ]
        );
        assert_eq!(failed(&checks), Vec::<&str>::new());
    }

    #[tokio::test]
    async fn wrong_activation_status_fails_only_that_check() {
        let server = MockServer::start().await;
        mount_travel_service(&server, 200).await;
        let mut client = client();
        let base_url = Url::parse(&server.uri()).unwrap();

        let checks = TravelLifecycle::new(&mut client, &base_url)
            .unwrap()
            .run()
            .await;

        assert_eq!(checks.len(), 6);
        assert_eq!(failed(&checks), vec!["Draft activated"]);
    }

    #[tokio::test]
    async fn unreachable_service_fails_every_check() {
        let server = MockServer::start().await;
        let base_url = Url::parse(&server.uri()).unwrap();
        drop(server);
        let mut client = client();

        let checks = TravelLifecycle::new(&mut client, &base_url)
            .unwrap()
            .run()
            .await;

        assert_eq!(failed(&checks).len(), 6);
    }

    #[test]
    fn travel_id_is_written_bare() {
        let numeric: TravelKey =
            serde_json::from_value(json!({"TravelUUID": "u", "IsActiveEntity": true, "TravelID": 7}))
                .unwrap();
        let text: TravelKey = serde_json::from_value(json!({"TravelID": "0007"})).unwrap();

        assert_eq!(numeric.travel_id(), "7");
        assert_eq!(text.travel_id(), "0007");
        assert_eq!(TravelKey::default().travel_id(), "");
        assert_eq!(
            numeric.entity_path(),
            "Travel(TravelUUID='u',IsActiveEntity=true)"
        );
    }

    #[test]
    fn draft_runs_for_a_week() {
        let details = draft_details();
        let begin = chrono::NaiveDate::parse_from_str(details["BeginDate"].as_str().unwrap(), "%Y-%m-%d").unwrap();
        let end = chrono::NaiveDate::parse_from_str(details["EndDate"].as_str().unwrap(), "%Y-%m-%d").unwrap();

        assert_eq!((end - begin).num_days(), 7);
    }
}
