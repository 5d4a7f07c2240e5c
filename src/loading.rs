//! "Service is starting" responses
//!
//! The interceptor answers 202 with this page while a wake is in progress.
//! Browsers get a bare HTML page that refreshes itself; API clients get JSON.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, ACCEPT, CACHE_CONTROL, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::service::{ServiceDescriptor, ServiceStatus};

/// Upper bound on how long clients are told to wait before retrying
const MAX_RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadingPage {
    pub service: String,
    pub status: ServiceStatus,
    pub title: String,
    pub message: String,
    pub estimated_seconds: u64,
    pub retry_after_secs: u64,
}

impl LoadingPage {
    pub fn for_service(service: &ServiceDescriptor) -> Self {
        let config = &service.loading_page;
        Self {
            service: service.name.clone(),
            status: service.status,
            title: config.title(&service.name),
            message: config.message.clone(),
            estimated_seconds: config.estimated_seconds,
            retry_after_secs: config.estimated_seconds.clamp(1, MAX_RETRY_AFTER_SECS),
        }
    }

    pub fn to_html(&self) -> String {
        format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n\
             <meta charset=\"utf-8\">\n\
             <meta http-equiv=\"refresh\" content=\"{refresh}\">\n\
             <title>{title}</title>\n</head>\n<body>\n\
             <h1>{title}</h1>\n<p>{message}</p>\n\
             <p>Estimated wait: {estimated} seconds</p>\n\
             </body>\n</html>\n",
            refresh = self.retry_after_secs,
            title = escape_html(&self.title),
            message = escape_html(&self.message),
            estimated = self.estimated_seconds,
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// 202 response, JSON when the client prefers it
    pub fn response(&self, request_headers: &HeaderMap) -> Response<BoxBody<Bytes, hyper::Error>> {
        let (content_type, body) = if wants_json(request_headers) {
            ("application/json", self.to_json())
        } else {
            ("text/html; charset=utf-8", self.to_html())
        };

        Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(CONTENT_TYPE, content_type)
            .header(RETRY_AFTER, self.retry_after_secs)
            .header(CACHE_CONTROL, "no-store")
            .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
            .expect("valid response with static headers")
    }
}

/// True when the client accepts JSON but not HTML
pub fn wants_json(headers: &HeaderMap) -> bool {
    let accept = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    accept.contains("application/json") && !accept.contains("text/html")
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{NewService, PortMapping, RuntimeRef};
    use chrono::Utc;
    use hyper::header::HeaderValue;

    fn page() -> LoadingPage {
        let desc = NewService::new(
            "web",
            "web",
            RuntimeRef::image("nginx"),
            vec![PortMapping::new(80, 8080)],
        )
        .into_descriptor(Utc::now());
        LoadingPage::for_service(&desc)
    }

    #[test]
    fn test_page_from_defaults() {
        let page = page();
        assert_eq!(page.title, "Starting web...");
        assert_eq!(page.estimated_seconds, 30);
        assert_eq!(page.retry_after_secs, 5);
        assert_eq!(page.status, ServiceStatus::Stopped);
    }

    #[test]
    fn test_html_escapes_and_refreshes() {
        let mut page = page();
        page.message = "<script>alert(1)</script>".into();
        let html = page.to_html();
        assert!(html.contains("<meta http-equiv=\"refresh\" content=\"5\">"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
    }

    #[test]
    fn test_json_fields() {
        let json: serde_json::Value = serde_json::from_str(&page().to_json()).unwrap();
        assert_eq!(json["service"], "web");
        assert_eq!(json["status"], "stopped");
        assert_eq!(json["retry_after_secs"], 5);
    }

    #[test]
    fn test_accept_negotiation() {
        let mut headers = HeaderMap::new();
        assert!(!wants_json(&headers));

        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        assert!(wants_json(&headers));

        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/json;q=0.9"),
        );
        assert!(!wants_json(&headers));
    }

    #[test]
    fn test_response_is_accepted() {
        let response = page().response(&HeaderMap::new());
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "5");
        assert!(response
            .headers()
            .get(CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html"));
    }
}
