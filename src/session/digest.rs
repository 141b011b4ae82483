use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU32, Ordering},
};

use http::{
    HeaderMap,
    HeaderValue,
    StatusCode,
    header::{AUTHORIZATION, WWW_AUTHENTICATE},
};
use tokio::sync::oneshot;

use crate::{
    error::TransportError,
    prelude::*,
    single_flight::{SingleFlight, Snapshot},
    transport::{Request, Response, Transport},
};

/// Lifecycle of an HTTP digest session.
#[derive(Copy, Clone, Debug, Eq, PartialEq, derive_more::Display)]
pub enum DigestPhase {
    /// No challenge has been received yet.
    #[display("unauthenticated")]
    Unauthenticated,

    /// The device has sent a challenge, but no authorized request has succeeded yet.
    #[display("challenged")]
    Challenged,

    /// Authorized requests succeed, or the device does not require authentication at all.
    #[display("authenticated")]
    Authenticated,

    /// The device has rejected the credentials.
    #[display("rejected")]
    Rejected,
}

/// HTTP digest authentication (RFC 7616) as spoken by the legacy XML API.
pub struct DigestSession {
    transport: Arc<dyn Transport>,
    username: String,
    password: String,

    /// Cached challenge, [`None`] when the device accepts unauthenticated requests.
    challenge: SingleFlight<Option<Arc<Challenge>>>,

    authenticated: AtomicBool,
    rejected: AtomicBool,
}

impl DigestSession {
    pub fn new(transport: Arc<dyn Transport>, username: String, password: String) -> Self {
        Self {
            transport,
            username,
            password,
            challenge: SingleFlight::default(),
            authenticated: AtomicBool::new(false),
            rejected: AtomicBool::new(false),
        }
    }

    /// Send the request, answering the challenge and retrying once on a stale nonce.
    #[instrument(skip_all, fields(path = request.path()))]
    pub async fn send(&self, request: Request) -> Result<Response> {
        let (mut grant, answer) = self.acquire_or_answer(&request).await?;
        if let Some(response) = answer {
            return Ok(response);
        }
        let mut is_retry = false;
        loop {
            let authorized = self.authorize(request.clone(), grant.as_deref())?;
            let response = self.transport.send(authorized).await?;
            if response.status != StatusCode::UNAUTHORIZED {
                if grant.is_some() {
                    self.authenticated.store(true, Ordering::Relaxed);
                }
                return Ok(response);
            }
            let fresh = Challenge::from_headers(&response.headers)?;
            match (grant, fresh) {
                (Some(used), Some(fresh)) if fresh.stale && !is_retry => {
                    debug!("nonce is stale, retrying with the new one");
                    let fresh = Arc::new(fresh);
                    let is_replaced = self
                        .challenge
                        .replace_if(
                            |current| is_same_nonce(current.as_deref(), &used),
                            Some(Arc::clone(&fresh)),
                        )
                        .await;
                    grant = if is_replaced {
                        Some(fresh)
                    } else {
                        // Another request has already picked up a newer nonce.
                        match self.acquire_or_answer(&request).await? {
                            (_, Some(response)) => return Ok(response),
                            (challenge, None) => challenge,
                        }
                    };
                }
                (None, Some(fresh)) if !is_retry => {
                    info!("the device now requires authentication");
                    let fresh = Arc::new(fresh);
                    self.challenge.replace_if(Option::is_none, Some(Arc::clone(&fresh))).await;
                    grant = Some(fresh);
                }
                _ => return Err(self.reject()),
            }
            is_retry = true;
        }
    }

    /// Challenge to answer, sending the request unauthenticated on the first call.
    ///
    /// The unauthenticated request is shared by all concurrent callers.
    pub async fn acquire(&self, request: &Request) -> Result<Option<Arc<Challenge>>> {
        self.acquire_or_answer(request).await.map(|(challenge, _)| challenge)
    }

    /// Same as [`Self::acquire`], plus the device's answer when this very call has sent the
    /// unauthenticated request and the device has accepted it.
    async fn acquire_or_answer(
        &self,
        request: &Request,
    ) -> Result<(Option<Arc<Challenge>>, Option<Response>)> {
        if self.rejected.load(Ordering::Relaxed) {
            return Err(Error::Authentication("the device has rejected the credentials".into()));
        }
        let transport = Arc::clone(&self.transport);
        let unauthenticated = request.clone();
        let (answer_sender, mut answer) = oneshot::channel();
        let challenge = self
            .challenge
            .get_or_fetch(
                |_| true,
                move || Self::request_challenge(transport, unauthenticated, answer_sender),
            )
            .await?;
        Ok((challenge, answer.try_recv().ok()))
    }

    /// Send the request unauthenticated to find out what the device expects.
    ///
    /// A successful response goes to `answer`.
    #[instrument(skip_all, fields(path = request.path()))]
    async fn request_challenge(
        transport: Arc<dyn Transport>,
        request: Request,
        answer: oneshot::Sender<Response>,
    ) -> Result<Option<Arc<Challenge>>> {
        debug!("requesting the challenge…");
        let path = request.path().to_owned();
        let response = transport.send(request).await?;
        if response.status.is_success() {
            info!("the device does not require authentication");
            // The caller may have been cancelled.
            let _ = answer.send(response);
            return Ok(None);
        }
        if response.status != StatusCode::UNAUTHORIZED {
            return Err(Error::Status { status: response.status, path });
        }
        let challenge = Challenge::from_headers(&response.headers)?.ok_or_else(|| {
            Error::Authentication("the device has not sent a digest challenge".into())
        })?;
        info!(realm = %challenge.realm, "challenged");
        Ok(Some(Arc::new(challenge)))
    }

    /// Attach the `Authorization` header answering the challenge.
    pub fn authorize(&self, mut request: Request, challenge: Option<&Challenge>) -> Result<Request> {
        if let Some(challenge) = challenge {
            let header = challenge.respond(&self.username, &self.password, &request);
            let header = HeaderValue::from_str(&header).map_err(TransportError::from)?;
            request.headers.insert(AUTHORIZATION, header);
        }
        Ok(request)
    }

    pub async fn invalidate(&self) {
        self.challenge.reset().await;
        self.authenticated.store(false, Ordering::Relaxed);
    }

    /// Forget the challenge and the rejection so that the next request starts over.
    pub async fn close(&self) {
        self.invalidate().await;
        self.rejected.store(false, Ordering::Relaxed);
    }

    pub async fn phase(&self) -> DigestPhase {
        if self.rejected.load(Ordering::Relaxed) {
            return DigestPhase::Rejected;
        }
        match self.challenge.snapshot().await {
            Snapshot::Empty | Snapshot::InFlight => DigestPhase::Unauthenticated,
            Snapshot::Ready(None) => DigestPhase::Authenticated,
            Snapshot::Ready(Some(_)) if self.authenticated.load(Ordering::Relaxed) => {
                DigestPhase::Authenticated
            }
            Snapshot::Ready(Some(_)) => DigestPhase::Challenged,
        }
    }

    fn reject(&self) -> Error {
        warn!(username = %self.username, "the device has rejected the credentials");
        self.rejected.store(true, Ordering::Relaxed);
        Error::Authentication("the device has rejected the credentials".into())
    }
}

fn is_same_nonce(current: Option<&Challenge>, used: &Challenge) -> bool {
    current.is_some_and(|current| current.nonce == used.nonce)
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Algorithm {
    Md5,
    Md5Session,
}

/// `WWW-Authenticate: Digest …` parameters.
#[derive(Debug)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,

    /// Whether `qop=auth` is offered.
    pub qop_auth: bool,

    pub algorithm: Algorithm,

    /// The nonce is outdated but the credentials are fine.
    pub stale: bool,

    /// Requests sent with this nonce so far.
    nonce_count: AtomicU32,
}

impl Challenge {
    /// Pick the digest challenge out of the response headers.
    ///
    /// Returns [`None`] when the device offers no digest challenge at all.
    pub fn from_headers(headers: &HeaderMap) -> Result<Option<Self>> {
        headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|value| {
                let (scheme, parameters) = value.trim().split_once(' ')?;
                scheme.eq_ignore_ascii_case("digest").then_some(parameters)
            })
            .map(Self::parse)
            .transpose()
    }

    pub fn parse(parameters: &str) -> Result<Self> {
        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop_auth = false;
        let mut qop_offered = false;
        let mut algorithm = Algorithm::Md5;
        let mut stale = false;

        for (name, value) in split_parameters(parameters)? {
            match name.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => {
                    qop_offered = true;
                    qop_auth = value.split(',').any(|qop| qop.trim().eq_ignore_ascii_case("auth"));
                }
                "algorithm" => {
                    algorithm = if value.eq_ignore_ascii_case("md5") {
                        Algorithm::Md5
                    } else if value.eq_ignore_ascii_case("md5-sess") {
                        Algorithm::Md5Session
                    } else {
                        return Err(Error::Authentication(format!(
                            "unsupported digest algorithm `{value}`"
                        )));
                    };
                }
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        if qop_offered && !qop_auth {
            return Err(Error::Authentication("the device offers no supported `qop`".into()));
        }
        Ok(Self {
            realm: realm.ok_or_else(|| ParseError::new("digest challenge lacks `realm`"))?,
            nonce: nonce.ok_or_else(|| ParseError::new("digest challenge lacks `nonce`"))?,
            opaque,
            qop_auth,
            algorithm,
            stale,
            nonce_count: AtomicU32::new(0),
        })
    }

    /// Build the `Authorization` header value for the request.
    ///
    /// Every call consumes the next nonce count.
    pub fn respond(&self, username: &str, password: &str, request: &Request) -> String {
        let nonce_count = self.nonce_count.fetch_add(1, Ordering::Relaxed) + 1;
        let client_nonce = hex::encode(rand::random::<[u8; 8]>());
        self.respond_with(username, password, request, nonce_count, &client_nonce)
    }

    fn respond_with(
        &self,
        username: &str,
        password: &str,
        request: &Request,
        nonce_count: u32,
        client_nonce: &str,
    ) -> String {
        let uri = request.target();
        let mut ha1 = md5_hex(&format!("{username}:{}:{password}", self.realm));
        if self.algorithm == Algorithm::Md5Session {
            ha1 = md5_hex(&format!("{ha1}:{}:{client_nonce}", self.nonce));
        }
        let ha2 = md5_hex(&format!("{}:{uri}", request.method));

        let mut header = format!(
            r#"Digest username="{}", realm="{}", nonce="{}", uri="{uri}""#,
            escape(username),
            escape(&self.realm),
            escape(&self.nonce),
        );
        if self.qop_auth {
            let response = md5_hex(&format!(
                "{ha1}:{}:{nonce_count:08x}:{client_nonce}:auth:{ha2}",
                self.nonce,
            ));
            header.push_str(&format!(
                r#", response="{response}", qop=auth, nc={nonce_count:08x}, cnonce="{client_nonce}""#
            ));
        } else {
            let response = md5_hex(&format!("{ha1}:{}:{ha2}", self.nonce));
            header.push_str(&format!(r#", response="{response}""#));
        }
        header.push_str(match self.algorithm {
            Algorithm::Md5 => ", algorithm=MD5",
            Algorithm::Md5Session => ", algorithm=MD5-sess",
        });
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(r#", opaque="{}""#, escape(opaque)));
        }
        header
    }
}

fn md5_hex(input: &str) -> String {
    let digest = md5::compute(input.as_bytes());
    format!("{digest:x}")
}

fn escape(value: &str) -> String {
    value.replace('\\', r"\\").replace('"', r#"\""#)
}

/// Split `name=value, name="quoted, value"` pairs.
fn split_parameters(input: &str) -> Result<Vec<(String, String)>> {
    let mut parameters = Vec::new();
    let mut chars = input.chars().peekable();
    loop {
        while chars.next_if(|char| char.is_whitespace() || *char == ',').is_some() {}
        if chars.peek().is_none() {
            return Ok(parameters);
        }
        let name: String = chars.by_ref().take_while(|char| *char != '=').collect();
        let name = name.trim();
        if name.is_empty() || name.contains(',') {
            return Err(ParseError::new(format!("malformed digest challenge `{input}`")).into());
        }
        while chars.next_if(|char| char.is_whitespace()).is_some() {}
        let mut value = String::new();
        if chars.next_if_eq(&'"').is_some() {
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => value.extend(chars.next()),
                    Some(char) => value.push(char),
                    None => {
                        return Err(ParseError::new(format!(
                            "unterminated quoted value in `{input}`"
                        ))
                        .into());
                    }
                }
            }
        } else {
            while let Some(char) = chars.next_if(|char| *char != ',') {
                value.push(char);
            }
            value = value.trim_end().to_owned();
        }
        parameters.push((name.to_owned(), value));
    }
}
