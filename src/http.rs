//! Default [`Transport`] implementation backed by `reqwest`.

use reqwest::header;

use serde_json::Value;

use crate::transport::{
    FailureHint, ResponseFormat, Transport, TransportFailure, TransportRequest,
};

/// HTTP transport over a shared `reqwest::Client`.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a pre-configured client (connection pools, proxies, TLS).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    fn method_of(request: &TransportRequest) -> reqwest::Method {
        match request.method {
            crate::transport::Method::Get => reqwest::Method::GET,
            crate::transport::Method::Post => reqwest::Method::POST,
            crate::transport::Method::Put => reqwest::Method::PUT,
            crate::transport::Method::Delete => reqwest::Method::DELETE,
            crate::transport::Method::Head => reqwest::Method::HEAD,
            crate::transport::Method::Patch => reqwest::Method::PATCH,
        }
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<Value, TransportFailure> {
        let mut builder = self.http.request(Self::method_of(&request), &request.url);

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(data) = &request.data {
            if request.method.sends_query_data() {
                builder = builder.query(&query_pairs(data));
            } else {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                builder = builder.json(data);
            }
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        let body = response.text().await.map_err(classify_reqwest_error)?;

        if !status.is_success() {
            return Err(TransportFailure::new(
                FailureHint::Http,
                Some(status.as_u16()),
                if body.is_empty() {
                    status
                        .canonical_reason()
                        .unwrap_or("http error")
                        .to_owned()
                } else {
                    body
                },
            ));
        }

        decode_body(request.response_format, &content_type, body)
    }
}

/// Encodes a JSON object into query-string pairs.
///
/// Scalar members are rendered directly; nested values are carried as
/// their JSON text, which keeps the encoding lossless for servers that
/// expect it.
fn query_pairs(data: &Value) -> Vec<(String, String)> {
    match data {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    Value::String(text) => text.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect(),
        Value::Null => Vec::new(),
        other => vec![("data".to_owned(), other.to_string())],
    }
}

fn decode_body(
    format: ResponseFormat,
    content_type: &str,
    body: String,
) -> Result<Value, TransportFailure> {
    let expect_json = match format {
        ResponseFormat::Json => true,
        ResponseFormat::Text => false,
        ResponseFormat::Auto => content_type.contains("json"),
    };

    if expect_json {
        serde_json::from_str(&body).map_err(|err| {
            TransportFailure::new(
                FailureHint::ParserError,
                None,
                format!("invalid JSON response: {err}"),
            )
        })
    } else {
        Ok(Value::String(body))
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportFailure {
    let hint = if err.is_timeout() {
        FailureHint::Timeout
    } else {
        FailureHint::Network
    };
    TransportFailure::new(hint, err.status().map(|status| status.as_u16()), err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_pairs_renders_scalars_and_nested_values() {
        let pairs = query_pairs(&json!({
            "name": "kit",
            "page": 2,
            "filter": {"active": true}
        }));
        assert!(pairs.contains(&("name".to_owned(), "kit".to_owned())));
        assert!(pairs.contains(&("page".to_owned(), "2".to_owned())));
        assert!(pairs.contains(&("filter".to_owned(), "{\"active\":true}".to_owned())));
    }

    #[test]
    fn decode_auto_falls_back_to_text_for_non_json() {
        let value = decode_body(ResponseFormat::Auto, "text/html", "<p>hi</p>".to_owned())
            .expect("text decodes");
        assert_eq!(value, Value::String("<p>hi</p>".to_owned()));
    }

    #[test]
    fn decode_json_failure_is_a_parser_error() {
        let failure = decode_body(ResponseFormat::Json, "application/json", "not json".to_owned())
            .expect_err("decode fails");
        assert_eq!(failure.hint, FailureHint::ParserError);
    }
}
