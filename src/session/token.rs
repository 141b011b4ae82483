use std::sync::Arc;

use base64::{
    Engine,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use chrono::{DateTime, TimeDelta, Utc};
use http::{HeaderValue, Method, StatusCode, header::AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, PickFirst, serde_as};
use url::Url;

use crate::{
    error::TransportError,
    prelude::*,
    single_flight::{SingleFlight, Snapshot},
    transport::{Request, Response, Transport},
};

/// Longest token lifetime the device is expected to grant.
const MAX_LIFETIME: TimeDelta = TimeDelta::days(1);

/// Base64url that tolerates both padded and unpadded input.
const JWT_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Lifecycle of a bearer token session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, derive_more::Display)]
pub enum TokenPhase {
    #[display("no token")]
    NoToken,

    /// A login is in flight.
    #[display("refreshing")]
    Refreshing,

    #[display("valid")]
    Valid,

    /// The token is past its refresh point, the next request logs in again.
    #[display("expired")]
    Expired,
}

/// JWT issued by the JSON API.
#[derive(Debug, Eq, PartialEq)]
pub struct Token {
    pub jwt: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Token {
    /// Read the expiry from the `beg` and `ltm` claims without verifying the signature.
    pub fn parse(jwt: String, now: DateTime<Utc>) -> Result<Self, ParseError> {
        #[serde_as]
        #[derive(Deserialize)]
        struct Claims {
            /// Issue time, Unix seconds.
            #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
            beg: f64,

            /// Lifetime, seconds.
            #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
            ltm: f64,
        }

        let payload = jwt
            .split('.')
            .nth(1)
            .ok_or_else(|| ParseError::new("malformed JWT: the payload segment is missing"))?;
        let payload = JWT_ENGINE
            .decode(payload)
            .map_err(|error| ParseError::new(format!("malformed JWT payload: {error}")))?;
        let claims: Claims = serde_json::from_slice(&payload)?;

        let lifetime = seconds(claims.ltm)?;
        if lifetime <= TimeDelta::zero() || lifetime > MAX_LIFETIME {
            return Err(ParseError::new(format!("implausible token lifetime {} s", claims.ltm)));
        }
        let issued_at = DateTime::<Utc>::UNIX_EPOCH
            .checked_add_signed(seconds(claims.beg)?)
            .ok_or_else(|| ParseError::new(format!("issue time {} is out of range", claims.beg)))?;
        let expires_at = issued_at
            .checked_add_signed(lifetime)
            .ok_or_else(|| ParseError::new("token expiry is out of range"))?;
        if expires_at < now {
            return Err(ParseError::new(format!("the token has already expired at `{expires_at}`")));
        }
        Ok(Self { jwt, issued_at, expires_at })
    }

    /// Whether the token may still be handed out, leaving `margin` to spare.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: TimeDelta) -> bool {
        now < self.expires_at - margin
    }
}

#[expect(clippy::cast_possible_truncation)]
fn seconds(value: f64) -> Result<TimeDelta, ParseError> {
    Some(value)
        .filter(|value| value.is_finite())
        .and_then(|value| TimeDelta::try_milliseconds((value * 1000.0).round() as i64))
        .ok_or_else(|| ParseError::new(format!("`{value}` is not a valid number of seconds")))
}

/// Bearer token authentication of the JSON API.
pub struct TokenSession {
    transport: Arc<dyn Transport>,
    base_url: Url,
    username: String,
    password: String,
    refresh_margin: TimeDelta,
    token: SingleFlight<Arc<Token>>,
}

impl TokenSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        base_url: Url,
        username: String,
        password: String,
        refresh_margin: TimeDelta,
    ) -> Self {
        Self {
            transport,
            base_url,
            username,
            password,
            refresh_margin,
            token: SingleFlight::default(),
        }
    }

    /// Send the request with the bearer token, logging in again once if the device rejects it.
    #[instrument(skip_all, fields(path = request.path()))]
    pub async fn send(&self, request: Request) -> Result<Response> {
        match self.send_once(request.clone()).await {
            Err(Error::TokenInvalidated) => {
                debug!("retrying with a new token");
                match self.send_once(request).await {
                    Err(Error::TokenInvalidated) => Err(Error::Authentication(
                        "the device rejects freshly issued tokens".into(),
                    )),
                    result => result,
                }
            }
            result => result,
        }
    }

    async fn send_once(&self, request: Request) -> Result<Response> {
        let token = self.acquire().await?;
        let response = self.transport.send(Self::authorize(request, &token)?).await?;
        if response.status == StatusCode::UNAUTHORIZED {
            self.invalidate(&token).await;
            return Err(Error::TokenInvalidated);
        }
        Ok(response)
    }

    /// Valid token, logging in if there is none or it is about to expire.
    ///
    /// Concurrent callers share a single login.
    pub async fn acquire(&self) -> Result<Arc<Token>> {
        let margin = self.refresh_margin;
        let login = Login {
            transport: Arc::clone(&self.transport),
            base_url: self.base_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        };
        self.token
            .get_or_fetch(move |token| token.is_fresh(Utc::now(), margin), move || login.run())
            .await
    }

    pub fn authorize(mut request: Request, token: &Token) -> Result<Request> {
        let header = HeaderValue::from_str(&format!("Bearer {}", token.jwt))
            .map_err(TransportError::from)?;
        request.headers.insert(AUTHORIZATION, header);
        Ok(request)
    }

    /// Drop the token, unless it has already been replaced by a newer one.
    pub async fn invalidate(&self, token: &Arc<Token>) {
        if self.token.invalidate_if(|current| Arc::ptr_eq(current, token)).await {
            info!("the token has been invalidated");
        }
    }

    /// Drop whatever token there is.
    pub async fn reset(&self) {
        self.token.reset().await;
    }

    /// Revoke the current token on the device, no-op if there is none.
    #[instrument(skip_all)]
    pub async fn close(&self) -> Result {
        let Some(token) = self.token.take().await else {
            return Ok(());
        };
        info!("logging out…");
        let request = Request::new(Method::GET, endpoint(&self.base_url, "api/auth/logout")?);
        let response = self.transport.send(Self::authorize(request, &token)?).await?;
        if response.status != StatusCode::OK {
            return Err(Error::Authentication(format!("logout failed with {}", response.status)));
        }
        Ok(())
    }

    pub async fn phase(&self) -> TokenPhase {
        match self.token.snapshot().await {
            Snapshot::Empty => TokenPhase::NoToken,
            Snapshot::InFlight => TokenPhase::Refreshing,
            Snapshot::Ready(token) if token.is_fresh(Utc::now(), self.refresh_margin) => {
                TokenPhase::Valid
            }
            Snapshot::Ready(_) => TokenPhase::Expired,
        }
    }
}

/// Everything a spawned login needs.
struct Login {
    transport: Arc<dyn Transport>,
    base_url: Url,
    username: String,
    password: String,
}

impl Login {
    #[instrument(skip_all, fields(username = %self.username))]
    async fn run(self) -> Result<Arc<Token>> {
        info!("logging in…");

        #[derive(Deserialize)]
        struct NonceResponse {
            #[serde(rename = "rlm")]
            realm: String,

            #[serde(rename = "nnc")]
            nonce: String,
        }

        #[derive(Serialize)]
        struct LoginRequest<'a> {
            #[serde(rename = "rlm")]
            realm: &'a str,

            #[serde(rename = "usr")]
            username: &'a str,

            #[serde(rename = "nnc")]
            nonce: &'a str,

            #[serde(rename = "cnnc")]
            client_nonce: &'a str,

            hash: &'a str,
        }

        #[derive(Deserialize)]
        struct LoginResponse {
            jwt: Option<String>,
            error: Option<String>,
        }

        let request =
            Request::new(Method::GET, endpoint(&self.base_url, "api/auth/unauthorized")?);
        let response = self.transport.send(request).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Err(Error::Authentication(format!(
                "failed to fetch the nonce: unexpected {}",
                response.status,
            )));
        }
        let NonceResponse { realm, nonce } =
            serde_json::from_str(&response.body).map_err(ParseError::from)?;

        let client_nonce = hex::encode(rand::random::<[u8; 16]>());
        let hash = login_hash(&self.username, &self.password, &realm, &nonce, &client_nonce);
        let request = Request::new(Method::POST, endpoint(&self.base_url, "api/auth/login")?)
            .with_json(&LoginRequest {
                realm: &realm,
                username: &self.username,
                nonce: &nonce,
                client_nonce: &client_nonce,
                hash: &hash,
            })?;
        let response = self.transport.send(request).await?;
        if response.status != StatusCode::OK {
            warn!(status = %response.status, "login failed");
            return Err(Error::Authentication(format!("login failed with {}", response.status)));
        }

        let response: LoginResponse =
            serde_json::from_str(&response.body).map_err(ParseError::from)?;
        match response {
            LoginResponse { error: Some(error), .. } => {
                warn!(%error, "login rejected");
                Err(Error::Authentication(error))
            }
            LoginResponse { jwt: Some(jwt), .. } => {
                let token = Token::parse(jwt, Utc::now())?;
                info!(expires_at = %token.expires_at, "logged in");
                Ok(Arc::new(token))
            }
            LoginResponse { jwt: None, error: None } => {
                Err(ParseError::new("the login response has neither `jwt` nor `error`").into())
            }
        }
    }
}

fn login_hash(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    client_nonce: &str,
) -> String {
    let ha1 = md5::compute(format!("{username}:{realm}:{password}"));
    let hash = md5::compute(format!("{ha1:x}:{nonce}:{client_nonce}"));
    format!("{hash:x}")
}

fn endpoint(base_url: &Url, path: &str) -> Result<Url> {
    base_url.join(path).map_err(|error| Error::Config(format!("invalid URL: {error}")))
}

#[cfg(test)]
pub mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use base64::engine::general_purpose;
    use futures_util::future::join_all;

    use super::*;
    use crate::transport::mock::MockTransport;

    /// Unsigned JWT with the device's `beg` and `ltm` claims.
    pub fn make_jwt(issued_at: i64, lifetime: i64, marker: usize) -> String {
        let payload = serde_json::json!({"beg": issued_at, "ltm": lifetime, "n": marker});
        format!(
            "eyJhbGciOiJIUzI1NiJ9.{}.signature",
            general_purpose::URL_SAFE_NO_PAD.encode(payload.to_string()),
        )
    }

    /// Device handing out tokens with the given lifetime and accepting only the latest one.
    pub fn device(lifetime: i64) -> (Arc<MockTransport>, Arc<AtomicUsize>) {
        let n_logins = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&n_logins);
        let transport = Arc::new(MockTransport::new(move |request| match request.path() {
            "/api/auth/unauthorized" => Response::new(
                StatusCode::UNAUTHORIZED,
                r#"{"rlm": "eGauge Administration", "nnc": "server-nonce"}"#,
            ),
            "/api/auth/login" => {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let jwt = make_jwt(Utc::now().timestamp(), lifetime, n);
                Response::new(StatusCode::OK, serde_json::json!({"jwt": jwt}).to_string())
            }
            "/api/auth/logout" => Response::new(StatusCode::OK, "{}"),
            _ => {
                let latest = counter.load(Ordering::SeqCst);
                let accepted = request.headers.get(AUTHORIZATION).is_some_and(|header| {
                    marker(header.to_str().unwrap().trim_start_matches("Bearer ")) == latest
                });
                if accepted {
                    Response::new(StatusCode::OK, "{}")
                } else {
                    Response::new(StatusCode::UNAUTHORIZED, "")
                }
            }
        }));
        (transport, n_logins)
    }

    fn marker(jwt: &str) -> usize {
        let payload = jwt.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&general_purpose::URL_SAFE_NO_PAD.decode(payload).unwrap())
                .unwrap();
        usize::try_from(claims["n"].as_u64().unwrap()).unwrap()
    }

    fn session(transport: Arc<MockTransport>) -> TokenSession {
        TokenSession::new(
            transport,
            Url::parse("https://meter.local/").unwrap(),
            "owner".into(),
            "secret".into(),
            TimeDelta::seconds(60),
        )
    }

    fn register_request() -> Request {
        Request::new(Method::GET, Url::parse("https://meter.local/api/register").unwrap())
    }

    #[test]
    fn login_hash_ok() {
        let ha1 = format!("{:x}", md5::compute("owner:eGauge Administration:secret"));
        let expected = format!("{:x}", md5::compute(format!("{ha1}:nnc:cnnc")));
        assert_eq!(login_hash("owner", "secret", "eGauge Administration", "nnc", "cnnc"), expected);
    }

    #[test]
    fn parse_token_ok() -> Result {
        let now = Utc::now();
        let token = Token::parse(make_jwt(now.timestamp(), 600, 1), now)?;
        assert_eq!(token.expires_at - token.issued_at, TimeDelta::seconds(600));
        assert!(token.is_fresh(now, TimeDelta::seconds(60)));
        assert!(!token.is_fresh(now + TimeDelta::seconds(541), TimeDelta::seconds(60)));
        Ok(())
    }

    #[test]
    fn parse_token_string_claims_and_padding() -> Result {
        let now = Utc::now();
        let payload = format!(r#"{{"beg": "{}", "ltm": "3600"}}"#, now.timestamp());
        let jwt = format!("x.{}.y", general_purpose::URL_SAFE.encode(payload));
        let token = Token::parse(jwt, now)?;
        assert_eq!(token.expires_at.timestamp(), now.timestamp() + 3600);
        Ok(())
    }

    #[test]
    fn parse_token_rejects_bad_claims() {
        let now = Utc::now();
        assert!(Token::parse(make_jwt(now.timestamp(), 0, 1), now).is_err());
        assert!(Token::parse(make_jwt(now.timestamp(), 86_401, 1), now).is_err());
        assert!(Token::parse(make_jwt(now.timestamp() - 7200, 3600, 1), now).is_err());
        assert!(Token::parse(make_jwt(10_000_000_000_000, 600, 1), now).is_err());
        assert!(Token::parse("no-payload".into(), now).is_err());
        assert!(Token::parse("x.!!!.y".into(), now).is_err());

        let jwt = format!("x.{}.y", general_purpose::URL_SAFE_NO_PAD.encode(r#"{"beg": 1}"#));
        assert!(Token::parse(jwt, now).is_err());
    }

    #[tokio::test]
    async fn concurrent_requests_log_in_once() -> Result {
        let (transport, n_logins) = device(600);
        let session = session(transport.clone());
        let requests = (0..16).map(|_| session.send(register_request()));
        for response in join_all(requests).await {
            assert_eq!(response?.status, StatusCode::OK);
        }
        assert_eq!(n_logins.load(Ordering::SeqCst), 1);
        assert_eq!(transport.count("/api/auth/unauthorized"), 1);
        assert_eq!(session.phase().await, TokenPhase::Valid);
        Ok(())
    }

    #[tokio::test]
    async fn valid_token_is_reused() -> Result {
        let (transport, n_logins) = device(600);
        let session = session(transport);
        session.acquire().await?;
        for _ in 0..100 {
            session.send(register_request()).await?;
        }
        assert_eq!(n_logins.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn token_near_expiry_is_refreshed() -> Result {
        // Lifetime is shorter than the refresh margin, so every token is immediately due.
        let (transport, n_logins) = device(30);
        let session = session(transport);
        let first = session.acquire().await?;
        assert_eq!(session.phase().await, TokenPhase::Expired);
        let second = session.acquire().await?;
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(n_logins.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_invalidations_refresh_once() -> Result {
        let (transport, n_logins) = device(600);
        let session = session(transport);
        session.acquire().await?;

        // The device forgets the token, every in-flight request sees a 401.
        n_logins.fetch_add(1, Ordering::SeqCst);
        let requests = (0..8).map(|_| session.send(register_request()));
        for response in join_all(requests).await {
            assert_eq!(response?.status, StatusCode::OK);
        }
        assert_eq!(n_logins.load(Ordering::SeqCst), 3, "the initial login, the bump, one re-login");
        Ok(())
    }

    #[tokio::test]
    async fn second_rejection_fails() {
        let transport = Arc::new(MockTransport::new(|request| match request.path() {
            "/api/auth/unauthorized" => {
                Response::new(StatusCode::UNAUTHORIZED, r#"{"rlm": "r", "nnc": "n"}"#)
            }
            "/api/auth/login" => {
                let jwt = make_jwt(Utc::now().timestamp(), 600, 1);
                Response::new(StatusCode::OK, serde_json::json!({"jwt": jwt}).to_string())
            }
            _ => Response::new(StatusCode::UNAUTHORIZED, ""),
        }));
        let session = session(transport.clone());
        let result = session.send(register_request()).await;
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(transport.count("/api/auth/login"), 2);
        assert_eq!(transport.count("/api/register"), 2);
    }

    #[tokio::test]
    async fn login_error_is_authentication_error() {
        let transport = Arc::new(MockTransport::new(|request| match request.path() {
            "/api/auth/unauthorized" => {
                Response::new(StatusCode::UNAUTHORIZED, r#"{"rlm": "r", "nnc": "n"}"#)
            }
            _ => Response::new(StatusCode::OK, r#"{"error": "invalid credentials"}"#),
        }));
        let result = session(transport).acquire().await;
        assert!(
            matches!(result, Err(Error::Authentication(message)) if message == "invalid credentials"),
        );
    }

    #[tokio::test]
    async fn login_without_jwt_is_parse_error() {
        let transport = Arc::new(MockTransport::new(|request| match request.path() {
            "/api/auth/unauthorized" => {
                Response::new(StatusCode::UNAUTHORIZED, r#"{"rlm": "r", "nnc": "n"}"#)
            }
            _ => Response::new(StatusCode::OK, "{}"),
        }));
        assert!(matches!(session(transport).acquire().await, Err(Error::Parse(_))));
    }

    #[tokio::test]
    async fn nonce_endpoint_must_answer_unauthorized() {
        let transport = Arc::new(MockTransport::new(|_| Response::new(StatusCode::OK, "{}")));
        assert!(matches!(session(transport).acquire().await, Err(Error::Authentication(_))));
    }

    #[tokio::test]
    async fn login_request_body() -> Result {
        let (transport, _) = device(600);
        session(transport.clone()).acquire().await?;
        let login = transport
            .requests()
            .into_iter()
            .find(|request| request.path() == "/api/auth/login")
            .unwrap();
        assert_eq!(login.method, Method::POST);
        let body: serde_json::Value = serde_json::from_slice(&login.body.unwrap()).unwrap();
        assert_eq!(body["rlm"], "eGauge Administration");
        assert_eq!(body["usr"], "owner");
        assert_eq!(body["nnc"], "server-nonce");
        let client_nonce = body["cnnc"].as_str().unwrap();
        assert_eq!(client_nonce.len(), 32);
        let expected =
            login_hash("owner", "secret", "eGauge Administration", "server-nonce", client_nonce);
        assert_eq!(body["hash"], expected);
        Ok(())
    }

    #[tokio::test]
    async fn close_logs_out() -> Result {
        let (transport, _) = device(600);
        let session = session(transport.clone());
        session.close().await?;
        assert_eq!(transport.count("/api/auth/logout"), 0, "no token, nothing to revoke");

        session.acquire().await?;
        session.close().await?;
        let requests = transport.requests();
        let logout = requests.last().unwrap();
        assert_eq!(logout.path(), "/api/auth/logout");
        assert!(logout.headers[AUTHORIZATION].to_str().unwrap().starts_with("Bearer "));
        assert_eq!(session.phase().await, TokenPhase::NoToken);
        Ok(())
    }
}
