//! End-to-end tests: a local identity provider and the gateway over HTTP.
//!
//! The fake IdP serves two key sets. Provider `a` is pointed at a key set
//! whose `test-key-1` does not match the fixture signing key, provider `b`
//! at the real one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::State,
    routing::{get, post},
};
use oidc_gateway::config::{Config, ProviderDescriptor};
use oidc_gateway::gateway::{CompositeRouter, Gateway};
use oidc_gateway::oidc::{HttpKeySetFetcher, KeySetCache};
use pretty_assertions::assert_eq;
use reqwest::{StatusCode, header};
use serde_json::{Value, json};
use tokio::net::TcpListener;

const JWKS: &str = include_str!("fixtures/jwks.json");
const JWKS_OTHER: &str = include_str!("fixtures/jwks_other.json");
const SIGNED: &str = include_str!("fixtures/signed_token.txt");

#[derive(Default)]
struct IdpState {
    token_calls: AtomicUsize,
    forms: parking_lot::Mutex<Vec<HashMap<String, String>>>,
}

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

async fn token_endpoint(State(state): State<Arc<IdpState>>, Form(form): Form<HashMap<String, String>>) -> Json<Value> {
    state.token_calls.fetch_add(1, Ordering::SeqCst);
    state.forms.lock().push(form);
    Json(json!({
        "access_token": SIGNED.trim(),
        "token_type": "Bearer",
        "expires_in": 300,
        "refresh_token": "refresh-1"
    }))
}

async fn start_idp() -> (SocketAddr, Arc<IdpState>) {
    let state = Arc::new(IdpState::default());
    let app = Router::new()
        .route(
            "/a/keys",
            get(|| async { Json(serde_json::from_str::<Value>(JWKS_OTHER).unwrap()) }),
        )
        .route(
            "/b/keys",
            get(|| async { Json(serde_json::from_str::<Value>(JWKS).unwrap()) }),
        )
        .route("/empty/keys", get(|| async { Json(json!({ "keys": [] })) }))
        .route("/b/token", post(token_endpoint))
        .route("/b/revoke", post(|| async { "" }))
        .with_state(Arc::clone(&state));
    (spawn(app).await, state)
}

fn provider(name: &str, idp: SocketAddr) -> ProviderDescriptor {
    ProviderDescriptor {
        name: name.into(),
        client_id: "my-client-id".into(),
        issuer: Some("https://idp.example.com".into()),
        authorization_uri: Some("https://idp.example.com/authorize".into()),
        token_uri: Some(format!("http://{idp}/{name}/token")),
        revoke_uri: Some(format!("http://{idp}/{name}/revoke")),
        jwks_uri: Some(format!("http://{idp}/{name}/keys")),
        redirect_uri: Some(format!("https://app/openid/{name}/callback")),
        roles_claim: Some("roles".into()),
        groups_claim: Some("groups".into()),
        ..ProviderDescriptor::default()
    }
}

async fn start_gateway(providers: Vec<ProviderDescriptor>) -> (String, Arc<CompositeRouter>) {
    let config = Config {
        providers,
        ..Config::default()
    };
    let gateway = Gateway::new(config).await.unwrap();
    let composite = Arc::clone(gateway.composite());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(gateway.serve(listener, std::future::pending()));
    (format!("http://{addr}"), composite)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap()
}

fn cookie_of(response: &reqwest::Response) -> String {
    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

#[tokio::test]
async fn rejected_by_first_provider_accepted_by_second() {
    let (idp, _) = start_idp().await;
    let (base, _) = start_gateway(vec![provider("a", idp), provider("b", idp)]).await;

    let response = client()
        .get(format!("{base}/whoami"))
        .bearer_auth(SIGNED.trim())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["provider"], "b");
    assert_eq!(body["principal"]["name"], "alice");
    assert_eq!(body["principal"]["roles"], json!(["admin", "reader"]));
    assert_eq!(body["principal"]["groups"], json!(["engineering"]));
    assert!(body.get("access_token").is_none());
}

#[tokio::test]
async fn token_rejected_everywhere_is_unauthenticated() {
    let (idp, _) = start_idp().await;
    let (base, _) = start_gateway(vec![provider("a", idp)]).await;

    let response = client()
        .get(format!("{base}/whoami"))
        .bearer_auth(SIGNED.trim())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["login"], json!(["/openid/a/login"]));
}

#[tokio::test]
async fn access_token_query_parameter_is_accepted() {
    let (idp, _) = start_idp().await;
    let (base, _) = start_gateway(vec![provider("b", idp)]).await;

    let response = client()
        .get(format!("{base}/whoami"))
        .query(&[("access_token", SIGNED.trim())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn access_token_form_parameter_is_accepted() {
    let (idp, _) = start_idp().await;
    let (base, _) = start_gateway(vec![provider("b", idp)]).await;

    let response = client()
        .post(format!("{base}/whoami"))
        .form(&[("access_token", SIGNED.trim())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["principal"]["name"], "alice");
}

#[tokio::test]
async fn form_posted_callback_completes_login() {
    let (idp, state) = start_idp().await;
    let (base, _) = start_gateway(vec![provider("b", idp)]).await;
    let http = client();

    let response = http.get(format!("{base}/openid/b/login")).send().await.unwrap();
    let location = url::Url::parse(response.headers()[header::LOCATION].to_str().unwrap()).unwrap();
    let login_state = location
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    let response = http
        .post(format!("{base}/openid/b/callback"))
        .form(&[("code", "posted-code"), ("state", login_state.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert!(cookie_of(&response).starts_with("oidc_session="));
    assert_eq!(state.forms.lock()[0]["code"], "posted-code");
}

#[tokio::test]
async fn health_is_public_and_lists_providers() {
    let (idp, _) = start_idp().await;
    let (base, _) = start_gateway(vec![provider("a", idp), provider("b", idp)]).await;

    let body: Value = client()
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["providers"], json!(["a", "b"]));
}

#[tokio::test]
async fn login_redirects_to_provider_and_unknown_provider_is_404() {
    let (idp, _) = start_idp().await;
    let (base, _) = start_gateway(vec![provider("b", idp)]).await;

    let response = client()
        .get(format!("{base}/openid/b/login"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("https://idp.example.com/authorize?"));
    assert!(location.contains("code_challenge_method=S256"));

    let response = client()
        .get(format!("{base}/openid/nope/login"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn callback_with_unknown_state_is_rejected() {
    let (idp, state) = start_idp().await;
    let (base, _) = start_gateway(vec![provider("b", idp)]).await;

    let response = client()
        .get(format!("{base}/openid/b/callback?code=abc&state=forged"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(state.token_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn browser_login_session_refresh_and_logout() {
    let (idp, state) = start_idp().await;
    let (base, _) = start_gateway(vec![provider("b", idp)]).await;
    let http = client();

    // Start the login and pick the state out of the authorize URL
    let response = http
        .get(format!("{base}/openid/b/login?return_to=/whoami"))
        .send()
        .await
        .unwrap();
    let location = url::Url::parse(response.headers()[header::LOCATION].to_str().unwrap()).unwrap();
    let login_state = location
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    // Provider redirects back with a code
    let response = http
        .get(format!("{base}/openid/b/callback"))
        .query(&[("code", "the-code"), ("state", login_state.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/whoami");
    let cookie = cookie_of(&response);
    assert!(cookie.starts_with("oidc_session="));

    {
        let forms = state.forms.lock();
        assert_eq!(forms[0]["grant_type"], "authorization_code");
        assert_eq!(forms[0]["code"], "the-code");
        assert!(forms[0].contains_key("code_verifier"));
    }

    // The state is single use
    let response = http
        .get(format!("{base}/openid/b/callback"))
        .query(&[("code", "the-code"), ("state", login_state.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Session cookie authenticates
    let body: Value = http
        .get(format!("{base}/whoami"))
        .header(header::COOKIE, &cookie)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["principal"]["name"], "alice");

    // Refresh goes through the provider's token endpoint
    let response = http
        .post(format!("{base}/openid/b/refresh"))
        .header(header::COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(state.forms.lock()[1]["grant_type"], "refresh_token");
    assert_eq!(state.forms.lock()[1]["refresh_token"], "refresh-1");

    // Logout ends the session
    let response = http
        .post(format!("{base}/openid/b/logout"))
        .header(header::COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[header::SET_COOKIE].to_str().unwrap().contains("Max-Age=0"));

    let response = http
        .get(format!("{base}/whoami"))
        .header(header::COOKIE, &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn empty_key_set_yields_no_key() {
    let (idp, _) = start_idp().await;
    let keys = KeySetCache::new(
        "empty",
        format!("http://{idp}/empty/keys"),
        Arc::new(HttpKeySetFetcher::new(Duration::from_secs(2))),
    );

    assert!(keys.get_key(Some("kid1")).await.is_none());
    assert!(keys.is_empty());
}

#[tokio::test]
async fn no_providers_passes_everything_through() {
    let (base, composite) = start_gateway(vec![]).await;
    assert!(composite.registry().is_empty());

    let response = client()
        .get(format!("{base}/whoami"))
        .bearer_auth("anything")
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["login"], json!([]));
}
