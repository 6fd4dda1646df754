//! Command implementations. Each returns the JSON value printed on stdout.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use market_auth::{FileSessionStore, MemorySessionStore, SessionStore};
use market_client::{ApiClient, ApiResponse, ClientError, RequestDescriptor};
use reqwest::Method;
use serde_json::{Value, json};
use tracing::info;

use crate::config::Config;

/// Build the client from config: file-backed store when a session path is
/// configured, in-memory otherwise.
pub fn build_client(config: &Config) -> Result<ApiClient> {
    let store: Arc<dyn SessionStore> = match &config.session.path {
        Some(path) => Arc::new(
            FileSessionStore::load(path.clone())
                .with_context(|| format!("failed to open session file {}", path.display()))?,
        ),
        None => Arc::new(MemorySessionStore::new()),
    };

    ApiClient::builder(config.api.base_url.as_str())
        .store(store)
        .signal(Arc::new(|| {
            eprintln!("session expired; run `marketplace login` to sign in again");
        }))
        .timeout(config.timeout())
        .refresh_timeout(config.refresh_timeout())
        .build()
        .context("failed to build API client")
}

pub async fn login(client: &ApiClient, email: &str, password: &str) -> Result<Value> {
    let session = client.login(email, password).await.map_err(explain)?;
    Ok(json!({ "status": "signed_in", "email": email, "role": session.role }))
}

pub async fn register(
    client: &ApiClient,
    username: &str,
    email: &str,
    password: &str,
) -> Result<Value> {
    let user = client
        .register(username, email, password)
        .await
        .map_err(explain)?;
    info!(%email, "account created");
    Ok(user)
}

pub fn logout(client: &ApiClient) -> Value {
    client.logout();
    json!({ "status": "signed_out" })
}

pub async fn whoami(client: &ApiClient) -> Result<Value> {
    if !client.is_authenticated() {
        bail!("not signed in; run `marketplace login`");
    }
    let response = client
        .send(RequestDescriptor::get(market_auth::ME_PATH))
        .await
        .map_err(explain)?;
    Ok(body_value(&response))
}

pub async fn request(
    client: &ApiClient,
    method: &str,
    path: &str,
    data: Option<&str>,
    query: &[String],
) -> Result<Value> {
    let request = build_request(method, path, data, query)?;
    let response = client.send(request).await.map_err(explain)?;
    Ok(body_value(&response))
}

fn build_request(
    method: &str,
    path: &str,
    data: Option<&str>,
    query: &[String],
) -> Result<RequestDescriptor> {
    let method = parse_method(method)?;
    let mut request = RequestDescriptor::new(method, path);

    for pair in query {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("query parameter must be KEY=VALUE, got {pair:?}"))?;
        request = request.query_param(key, value);
    }

    if let Some(data) = data {
        let body: Value = serde_json::from_str(data).context("--data must be valid JSON")?;
        request = request.json(&body)?;
    }

    Ok(request)
}

fn parse_method(method: &str) -> Result<Method> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        other => bail!("unsupported method {other}"),
    }
}

/// JSON bodies are printed as-is, anything else as a JSON string.
fn body_value(response: &ApiResponse) -> Value {
    if response.body.is_empty() {
        return json!({ "status": response.status.as_u16() });
    }
    response
        .json::<Value>()
        .unwrap_or_else(|_| Value::String(response.text()))
}

/// Add a sign-in hint to errors that end the session.
fn explain(e: ClientError) -> anyhow::Error {
    if e.requires_login() {
        anyhow::Error::new(e).context("authentication required; run `marketplace login`")
    } else {
        anyhow::Error::new(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::response::IntoResponse;
    use market_auth::{Role, Session};
    use tokio::net::TcpListener;

    /// Backend that accepts only `Bearer at_ok` and echoes method, path and query.
    async fn start_mock_api() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = axum::Router::new().fallback(
            |method: axum::http::Method, uri: Uri, headers: HeaderMap| async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                if auth != "Bearer at_ok" {
                    return (StatusCode::UNAUTHORIZED, "Could not validate credentials")
                        .into_response();
                }
                if uri.path() == "/plain" {
                    return "pong".into_response();
                }
                axum::Json(json!({
                    "method": method.as_str(),
                    "path": uri.path(),
                    "query": uri.query().unwrap_or(""),
                }))
                .into_response()
            },
        );

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn seed_session(path: &std::path::Path, session: Session) {
        let store = FileSessionStore::load(path.to_path_buf()).unwrap();
        store.write(session);
        store.flush().await;
    }

    fn config_for(base_url: &str, session: Option<std::path::PathBuf>) -> Config {
        let mut config = Config::default();
        config.api.base_url = base_url.to_string();
        config.session.path = session;
        config
    }

    #[test]
    fn parse_method_is_case_insensitive() {
        assert_eq!(parse_method("get").unwrap(), Method::GET);
        assert_eq!(parse_method("Patch").unwrap(), Method::PATCH);
        assert!(parse_method("TRACE").is_err());
    }

    #[test]
    fn build_request_collects_query_and_body() {
        let request = build_request(
            "post",
            "/products/",
            Some(r#"{"name":"lamp"}"#),
            &["page=2".to_string(), "q=a=b".to_string()],
        )
        .unwrap();

        assert_eq!(request.method(), &Method::POST);
        assert_eq!(
            request.query_pairs(),
            &[
                ("page".to_string(), "2".to_string()),
                ("q".to_string(), "a=b".to_string())
            ]
        );
        assert_eq!(request.body_bytes().unwrap().as_ref(), br#"{"name":"lamp"}"#);
    }

    #[test]
    fn build_request_rejects_bad_input() {
        assert!(build_request("GET", "/x", None, &["novalue".to_string()]).is_err());
        assert!(build_request("POST", "/x", Some("{not json"), &[]).is_err());
    }

    #[tokio::test]
    async fn request_uses_stored_session() {
        let base = start_mock_api().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        seed_session(&path, Session::new("at_ok", "rt_ok", Role::Buyer)).await;

        let client = build_client(&config_for(&base, Some(path))).unwrap();
        let value = request(&client, "GET", "/products/", None, &["page=1".to_string()])
            .await
            .unwrap();

        assert_eq!(value["method"], "GET");
        assert_eq!(value["path"], "/products/");
        assert_eq!(value["query"], "page=1");

        let text = request(&client, "GET", "/plain", None, &[]).await.unwrap();
        assert_eq!(text, Value::String("pong".into()));
    }

    #[tokio::test]
    async fn whoami_without_session_asks_for_login() {
        let client = build_client(&config_for("http://127.0.0.1:1", None)).unwrap();
        let err = whoami(&client).await.unwrap_err();
        assert!(err.to_string().contains("marketplace login"));
    }

    #[tokio::test]
    async fn expired_session_without_refresh_explains_login() {
        let base = start_mock_api().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        seed_session(&path, Session::new("at_old", "", Role::Buyer)).await;

        let client = build_client(&config_for(&base, Some(path.clone()))).unwrap();
        let err = request(&client, "GET", "/cart/", None, &[]).await.unwrap_err();

        assert!(err.to_string().contains("marketplace login"), "got {err:#}");
        client.flush().await;
        assert!(!path.exists(), "teardown removes the session file");
    }

    #[tokio::test]
    async fn logout_reports_signed_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        seed_session(&path, Session::new("at", "rt", Role::Seller)).await;

        let client = build_client(&config_for("http://127.0.0.1:8000", Some(path.clone()))).unwrap();
        assert_eq!(logout(&client), json!({ "status": "signed_out" }));
        client.flush().await;
        assert!(!path.exists());
    }
}
