//! The request the flight app's analytics page starts with: the list of bookings, read with a
//! bearer token.

use sso_squall_runner::prelude::{BearerToken, HttpClientInstrumented, HttpRequest, Url};

pub const BOOKINGS_PATH: &str = "analytics/Bookings";

/// Fetch the bookings and report whether the service answered with 200.
pub async fn load_bookings(
    client: &mut HttpClientInstrumented,
    base_url: &Url,
    token: &BearerToken,
) -> bool {
    let url = format!("{}/{BOOKINGS_PATH}", base_url.as_str().trim_end_matches('/'));
    let request = HttpRequest::get(url)
        .header("Content-Type", "application/json")
        .header("Authorization", &token.header_value())
        .name("bookings")
        .tag("group", "initial_load");

    match client.send(request).await {
        Ok(response) if response.status.as_u16() == 200 => true,
        Ok(response) => {
            log::debug!("Bookings returned status {}", response.status);
            false
        }
        Err(e) => {
            log::warn!("Request failed: {e}");
            false
        }
    }
}
