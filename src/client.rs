use std::sync::Arc;

use bon::bon;
use chrono::{DateTime, Utc};
use http::{Method, StatusCode};
use indexmap::IndexMap;
use itertools::Itertools;
use url::Url;

use crate::{
    config::{Config, Protocol},
    delta::{IntervalChange, interval_changes},
    model::{DataKind, DataRow, Registers, TimeInterval},
    names::NameMap,
    parse::{JsonParser, ResponseParser, XmlParser},
    prelude::*,
    query::Query,
    registers::RegisterCache,
    session::{Session, SessionPhase},
    transport::{HttpTransport, Request, Transport},
};

const XML_INSTANTANEOUS_PATH: &str = "cgi-bin/egauge";
const XML_HISTORICAL_PATH: &str = "cgi-bin/egauge-show";
const JSON_REGISTER_PATH: &str = "api/register";

/// Stored history request.
#[derive(Clone, Debug, bon::Builder)]
#[must_use]
pub struct HistoricalQuery {
    /// Oldest timestamp, must be before `end`.
    pub start: DateTime<Utc>,

    /// Newest timestamp.
    pub end: DateTime<Utc>,

    pub interval: TimeInterval,

    /// Registers to return, all by default.
    pub registers: Option<Vec<String>>,

    /// Number of intervals to skip between returned rows.
    #[builder(default)]
    pub skip: u32,

    pub max_rows: Option<u32>,

    /// Instants to sample instead of the regular grid.
    ///
    /// The device returns the nearest stored rows, which are coarser for older data.
    pub timestamps: Option<Vec<DateTime<Utc>>>,
}

impl HistoricalQuery {
    fn register_names(&self) -> Option<Vec<&str>> {
        self.registers.as_ref().map(|registers| registers.iter().map(String::as_str).collect())
    }

    /// `T` and `time` list of the sampled instants, newest first.
    fn timestamp_list(&self) -> Option<String> {
        self.timestamps
            .as_ref()
            .filter(|timestamps| !timestamps.is_empty())
            .map(|timestamps| timestamps.iter().map(DateTime::timestamp).sorted().rev().join(","))
    }
}

/// eGauge meter client.
///
/// Cheap to clone: clones share the session and the register caches.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    protocol: Protocol,
    base_url: Url,
    session: Session,
    registers: RegisterCache,
    name_overrides: IndexMap<String, String>,
}

#[bon]
impl Client {
    /// Build the client on top of a custom transport.
    #[builder]
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let base_url = config.base_url();
        let session = match (config.protocol, config.credentials()) {
            (_, None) => Session::Anonymous(transport),
            (Protocol::Xml, Some((username, password))) => {
                Session::digest(transport, username.to_owned(), password.to_owned())
            }
            (Protocol::Json, Some((username, password))) => Session::token(
                transport,
                base_url.clone(),
                username.to_owned(),
                password.to_owned(),
                config.token_refresh_margin,
            ),
        };
        let inner = Inner {
            protocol: config.protocol,
            base_url,
            session,
            registers: RegisterCache::default(),
            name_overrides: config.name_overrides,
        };
        Ok(Self { inner: Arc::new(inner) })
    }
}

impl Client {
    /// Build the client with the default HTTP transport.
    pub fn from_config(config: Config) -> Result<Self> {
        let transport = HttpTransport::try_new(config.timeout, config.accept_invalid_certs)?;
        Self::builder().config(config).transport(Arc::new(transport)).build()
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    pub async fn session_phase(&self) -> SessionPhase {
        self.inner.session.phase().await
    }

    /// Fetch the digest challenge or log in ahead of the first data request.
    #[instrument(skip_all, fields(protocol = %self.inner.protocol))]
    pub async fn authenticate(&self) -> Result {
        let path = match self.inner.protocol {
            Protocol::Xml => XML_INSTANTANEOUS_PATH,
            Protocol::Json => JSON_REGISTER_PATH,
        };
        let request = Request::new(Method::GET, self.inner.url(path)?);
        self.inner.session.acquire(&request).await
    }

    /// Forget the credentials, the next request authenticates from scratch.
    pub async fn invalidate_session(&self) {
        self.inner.session.invalidate().await;
    }

    /// Current snapshot of the registers, all of them by default.
    ///
    /// XML samples carry the cumulative value and the rate, JSON samples carry the rate.
    #[instrument(skip_all, fields(protocol = %self.inner.protocol, registers = ?registers))]
    pub async fn get_current_measurements(&self, registers: Option<&[&str]>) -> Result<DataRow> {
        info!("fetching…");
        if let Some(registers) = registers {
            self.ensure_known(DataKind::Instantaneous, registers).await?;
        }
        let mut row = match self.inner.protocol {
            Protocol::Xml => {
                let query = Query::new().flag("inst").flag("tot");
                let body = self.inner.get(XML_INSTANTANEOUS_PATH, &query).await?;
                XmlParser.parse_instantaneous(&body)?
            }
            Protocol::Json => {
                let mut query = Query::new().flag("rate");
                if let Some(registers) = registers {
                    let known = self.get_instantaneous_registers().await?;
                    query = query.pair("reg", register_selection(&known, registers)?);
                }
                let body = self.inner.get(JSON_REGISTER_PATH, &query).await?;
                JsonParser.parse_instantaneous(&body)?
            }
        };
        self.rebind(DataKind::Instantaneous, std::slice::from_mut(&mut row)).await?;
        if let Some(registers) = registers {
            row.retain_registers(registers);
        }
        debug!(timestamp = %row.timestamp, n_registers = row.registers.len(), "fetched");
        Ok(row)
    }

    /// Current rates by register name.
    ///
    /// Registers that report no rate are left out.
    pub async fn get_current_rates(
        &self,
        registers: Option<&[&str]>,
    ) -> Result<IndexMap<String, f64>> {
        let row = self.get_current_measurements(registers).await?;
        Ok(row
            .registers
            .into_iter()
            .filter_map(|(name, sample)| sample.rate.map(|rate| (name, rate)))
            .collect())
    }

    /// Stored cumulative counters between `start` and `end`, oldest first.
    pub async fn get_historical_series(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: TimeInterval,
        registers: Option<&[&str]>,
    ) -> Result<Vec<DataRow>> {
        let query = HistoricalQuery::builder()
            .start(start)
            .end(end)
            .interval(interval)
            .maybe_registers(
                registers.map(|registers| registers.iter().map(ToString::to_string).collect()),
            )
            .build();
        self.query_history(&query).await
    }

    /// Stored cumulative counters, oldest first.
    #[instrument(
        skip_all,
        fields(
            protocol = %self.inner.protocol,
            start = %query.start,
            end = %query.end,
            interval = %query.interval
        )
    )]
    pub async fn query_history(&self, query: &HistoricalQuery) -> Result<Vec<DataRow>> {
        if query.start >= query.end {
            return Err(Error::InvalidRange { start: query.start, end: query.end });
        }
        info!("fetching…");
        let registers = query.register_names();
        if let Some(registers) = &registers {
            self.ensure_known(DataKind::Historical, registers).await?;
        }

        let mut rows = match self.inner.protocol {
            Protocol::Xml => {
                let mut wire_query = Query::new()
                    .flag("a")
                    .pair("t", query.start.timestamp())
                    .pair("f", query.end.timestamp())
                    .flag(query.interval.xml_flag());
                if query.skip != 0 {
                    wire_query = wire_query.pair("s", query.skip);
                }
                if let Some(timestamps) = query.timestamp_list() {
                    wire_query = wire_query.pair("T", timestamps);
                }
                if let Some(max_rows) = query.max_rows {
                    wire_query = wire_query.pair("n", max_rows);
                }
                let body = self.inner.get(XML_HISTORICAL_PATH, &wire_query).await?;
                XmlParser.parse_historical(&body)?
            }
            Protocol::Json => {
                let time = query.timestamp_list().unwrap_or_else(|| {
                    let step = u64::from(query.interval.seconds()) * (u64::from(query.skip) + 1);
                    format!("{}:{step}:{}", query.start.timestamp(), query.end.timestamp())
                });
                let mut wire_query = Query::new().pair("time", time);
                if let Some(registers) = &registers {
                    let known = self.get_historical_registers().await?;
                    wire_query = wire_query.pair("reg", register_selection(&known, registers)?);
                }
                if let Some(max_rows) = query.max_rows {
                    wire_query = wire_query.pair("max-rows", max_rows);
                }
                let body = self.inner.get(JSON_REGISTER_PATH, &wire_query).await?;
                JsonParser.parse_historical(&body)?
            }
        };

        self.rebind(DataKind::Historical, &mut rows).await?;
        if let Some(registers) = &registers {
            for row in &mut rows {
                row.retain_registers(registers);
            }
        }
        debug!(n_rows = rows.len(), "fetched");
        Ok(rows)
    }

    /// Average rates between consecutive stored rows, of all registers by default.
    ///
    /// Register names may come from either namespace, the output keeps them as requested.
    pub async fn get_interval_changes(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: TimeInterval,
        registers: Option<&[&str]>,
    ) -> Result<Vec<IntervalChange>> {
        let query = HistoricalQuery::builder()
            .start(start)
            .end(end)
            .interval(interval)
            .maybe_registers(
                registers.map(|registers| registers.iter().map(ToString::to_string).collect()),
            )
            .build();
        self.query_interval_changes(&query).await
    }

    /// Average rates between consecutive rows of the history query.
    ///
    /// Each interval spans `skip + 1` of `query.interval`, so `skip = 14` over minutes yields
    /// quarter-hourly rates. Unlike in [`Client::query_history`], `query.registers` may name
    /// instantaneous registers as well.
    #[instrument(
        skip_all,
        fields(start = %query.start, end = %query.end, registers = ?query.registers)
    )]
    pub async fn query_interval_changes(
        &self,
        query: &HistoricalQuery,
    ) -> Result<Vec<IntervalChange>> {
        if query.start >= query.end {
            return Err(Error::InvalidRange { start: query.start, end: query.end });
        }
        let Some(registers) = query.register_names() else {
            let rows = self.query_history(query).await?;
            let columns = rows.first().map(|row| row.names().collect_vec()).unwrap_or_default();
            return interval_changes(&rows, &columns, &NameMap::default());
        };

        let historical = self.get_historical_registers().await?;
        let names = if registers.iter().all(|name| historical.contains_key(*name)) {
            NameMap::default()
        } else {
            self.name_map().await?
        };
        let columns = registers
            .iter()
            .map(|&name| {
                if historical.contains_key(name) {
                    name.to_owned()
                } else {
                    names.to_historical(name).unwrap_or(name).to_owned()
                }
            })
            .unique()
            .collect_vec();
        let query = HistoricalQuery { registers: Some(columns), ..query.clone() };
        let rows = self.query_history(&query).await?;
        interval_changes(&rows, &registers, &names)
    }

    /// Changes over each of the last `n_hours` hours.
    pub async fn get_hourly_changes(
        &self,
        n_hours: u32,
        registers: Option<&[&str]>,
    ) -> Result<Vec<IntervalChange>> {
        self.get_recent_changes(TimeInterval::Hour, 1, n_hours, registers).await
    }

    /// Changes over each of the last `n_days` days.
    pub async fn get_daily_changes(
        &self,
        n_days: u32,
        registers: Option<&[&str]>,
    ) -> Result<Vec<IntervalChange>> {
        self.get_recent_changes(TimeInterval::Day, 1, n_days, registers).await
    }

    /// Changes over each of the last `n_weeks` weeks, sampled at day boundaries.
    pub async fn get_weekly_changes(
        &self,
        n_weeks: u32,
        registers: Option<&[&str]>,
    ) -> Result<Vec<IntervalChange>> {
        self.get_recent_changes(TimeInterval::Day, 7, n_weeks, registers).await
    }

    /// Changes over the last `n_intervals` spans of `multiplier × interval`, ending now.
    ///
    /// The range reaches one span further back, so that the oldest requested span has a row
    /// at its start.
    async fn get_recent_changes(
        &self,
        interval: TimeInterval,
        multiplier: u32,
        n_intervals: u32,
        registers: Option<&[&str]>,
    ) -> Result<Vec<IntervalChange>> {
        let end = Utc::now();
        let start = i32::try_from(u64::from(multiplier) * (u64::from(n_intervals) + 1))
            .ok()
            .and_then(|n_spans| interval.duration().checked_mul(n_spans))
            .and_then(|span| end.checked_sub_signed(span))
            .ok_or(Error::InvalidRange { start: DateTime::<Utc>::MIN_UTC, end })?;
        let query = HistoricalQuery::builder()
            .start(start)
            .end(end)
            .interval(interval)
            .skip(multiplier - 1)
            .maybe_registers(
                registers.map(|registers| registers.iter().map(ToString::to_string).collect()),
            )
            .build();
        self.query_interval_changes(&query).await
    }

    pub async fn get_instantaneous_registers(&self) -> Result<Arc<Registers>> {
        self.registers(DataKind::Instantaneous).await
    }

    pub async fn get_historical_registers(&self) -> Result<Arc<Registers>> {
        self.registers(DataKind::Historical).await
    }

    /// Pairs of historical and instantaneous register names, see [`NameMap`].
    #[instrument(skip_all)]
    pub async fn name_map(&self) -> Result<NameMap> {
        let (instantaneous, historical) =
            tokio::try_join!(self.get_instantaneous_registers(), self.get_historical_registers())?;
        let names = NameMap::build(&instantaneous, &historical, &self.inner.name_overrides);
        for (historical, instantaneous) in names.discrepancies() {
            debug!(historical, instantaneous, "names differ");
        }
        Ok(names)
    }

    /// Forget the discovered registers of one or both kinds.
    pub async fn reset_register_cache(&self, kind: Option<DataKind>) {
        self.inner.registers.reset(kind).await;
    }

    /// Release the session: log out from the JSON API, forget the digest challenge and the
    /// discovered registers.
    #[instrument(skip_all)]
    pub async fn close(&self) -> Result {
        self.inner.registers.reset(None).await;
        self.inner.session.close().await
    }

    /// Run `f` and close the client afterwards, whatever `f` returns.
    ///
    /// The error of `f` takes precedence over the closing error.
    pub async fn scoped<F, Fut, T>(self, f: F) -> Result<T>
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = f(self.clone()).await;
        let closed = self.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => Err(error),
            (Err(error), closed) => {
                if let Err(close_error) = closed {
                    warn!(%close_error, "failed to close the client");
                }
                Err(error)
            }
        }
    }

    async fn registers(&self, kind: DataKind) -> Result<Arc<Registers>> {
        let inner = Arc::clone(&self.inner);
        self.inner.registers.get(kind, move || inner.discover(kind)).await
    }

    async fn ensure_known(&self, kind: DataKind, names: &[&str]) -> Result<Arc<Registers>> {
        let inner = &self.inner;
        inner
            .registers
            .ensure_known(kind, names.iter().copied(), || Arc::clone(inner).discover(kind))
            .await
    }

    /// Point the samples to the cached descriptors, re-discovering once if a name is missing.
    async fn rebind(&self, kind: DataKind, rows: &mut [DataRow]) -> Result {
        let names = rows.iter().flat_map(DataRow::names).unique().collect_vec();
        let registers = self.ensure_known(kind, &names).await?;
        for sample in rows.iter_mut().flat_map(|row| row.registers.values_mut()) {
            if let Some(descriptor) = registers.get(sample.name()) {
                sample.descriptor = Arc::clone(descriptor);
            }
        }
        Ok(())
    }
}

impl Inner {
    /// Fetch the register list of the namespace.
    #[instrument(skip_all, fields(kind = %kind))]
    async fn discover(self: Arc<Self>, kind: DataKind) -> Result<Arc<Registers>> {
        info!("discovering…");
        let descriptors = match (self.protocol, kind) {
            (Protocol::Xml, DataKind::Instantaneous) => {
                let query = Query::new().flag("inst").flag("tot");
                let body = self.get(XML_INSTANTANEOUS_PATH, &query).await?;
                XmlParser.parse_register_list(&body, kind)?
            }
            (Protocol::Xml, DataKind::Historical) => {
                let query = Query::new().flag("a").pair("n", 1).flag("S");
                let body = self.get(XML_HISTORICAL_PATH, &query).await?;
                XmlParser.parse_register_list(&body, kind)?
            }
            (Protocol::Json, _) => {
                let body = self.get(JSON_REGISTER_PATH, &Query::new()).await?;
                JsonParser.parse_register_list(&body, kind)?
            }
        };
        let registers: Registers = descriptors
            .into_iter()
            .map(|descriptor| (descriptor.name.clone(), Arc::new(descriptor)))
            .collect();
        info!(n_registers = registers.len(), "discovered");
        Ok(Arc::new(registers))
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|error| Error::Config(format!("invalid URL: {error}")))
    }

    /// Authenticated `GET`, returning the body of a successful response.
    async fn get(&self, path: &str, query: &Query) -> Result<String> {
        let request = Request::new(Method::GET, self.url(path)?).with_query(query)?;
        let response = self.session.send(request).await?;
        debug!(path, status = %response.status, n_bytes = response.body.len(), "response");
        match response.status {
            status if status.is_success() => Ok(response.body),
            StatusCode::UNAUTHORIZED => {
                Err(Error::Authentication(format!("`/{path}` requires authentication")))
            }
            StatusCode::FORBIDDEN => Err(Error::Permission(format!("/{path}"))),
            status => Err(Error::Status { status, path: format!("/{path}") }),
        }
    }
}

/// JSON API register selector: `none+IDX+IDX…`.
fn register_selection(known: &Registers, names: &[&str]) -> Result<String> {
    let indices = names
        .iter()
        .map(|name| {
            known
                .get(*name)
                .map(|descriptor| descriptor.index.to_string())
                .ok_or_else(|| Error::UnknownRegister((*name).to_owned()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(std::iter::once("none".to_owned()).chain(indices).join("+"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{TimeDelta, TimeZone};
    use futures_util::future::join_all;
    use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};

    use super::*;
    use crate::{
        session::{TokenPhase, make_jwt},
        transport::{
            Response,
            mock::{MockTransport, with_header},
        },
    };

    // language=XML
    const INSTANTANEOUS: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
        <data serial="0x7">
        <ts>1602539280</ts>
        <r t="P" n="Grid" did="0"><v>10007200</v><i>654</i></r>
        <r t="P" n="Solar" did="1"><v>14400</v><i>-120</i></r>
        <r t="P" n="Total Usage"><v>72000</v></r>
        </data>
    "#;

    // language=XML
    const REGISTER_LIST: &str = r#"<group serial="0x7">
        <data columns="3" time_stamp="0x5f84cf10" time_delta="1">
            <cname t="P" did="0">Grid</cname>
            <cname t="P" did="1">Solar</cname>
            <cname t="P">use</cname>
            <r><c>10007200</c><c>14400</c><c>72000</c></r>
        </data>
        </group>
    "#;

    // language=XML
    const PARTIAL_REGISTER_LIST: &str = r#"<group serial="0x7">
        <data columns="2" time_stamp="0x5f84cf10" time_delta="1">
            <cname t="P" did="0">Grid</cname>
            <cname t="P" did="1">Solar</cname>
            <r><c>10007200</c><c>14400</c></r>
        </data>
        </group>
    "#;

    // language=XML
    const HISTORY: &str = r#"<group serial="0x7">
        <data columns="3" time_stamp="0x5f84cf10" time_delta="3600">
            <cname t="P" did="0">Grid</cname>
            <cname t="P" did="1">Solar</cname>
            <cname t="P">use</cname>
            <r><c>10007200</c><c>14400</c><c>72000</c></r>
            <r><c>10003600</c><c>7200</c><c>36000</c></r>
            <r><c>10000000</c><c>0</c><c>0</c></r>
        </data>
        </group>
    "#;

    // language=JSON
    const JSON_REGISTERS: &str = r#"{
        "registers": [
            {"name": "Grid", "type": "P", "idx": 17, "did": 0},
            {"name": "Solar", "type": "P", "idx": 18, "did": 1}
        ]
    }"#;

    // language=JSON
    const JSON_RATES: &str = r#"{
        "ts": "1678330813.000129799",
        "registers": [
            {"name": "Grid", "type": "P", "idx": 17, "did": 0, "rate": 1798.5},
            {"name": "Solar", "type": "P", "idx": 18, "did": 1, "rate": -450.3}
        ]
    }"#;

    // language=JSON
    const JSON_HISTORY: &str = r#"{
        "registers": [{"name": "Grid", "type": "P", "idx": 17, "did": 0}],
        "ranges": [{"ts": "1678298400", "delta": 120, "rows": [["10003600"], ["10000000"]]}]
    }"#;

    /// Timestamp of the newest stored row in [`HISTORY`].
    fn newest() -> DateTime<Utc> {
        Utc.timestamp_opt(0x5f84_cf10, 0).unwrap()
    }

    fn config(protocol: Protocol) -> Config {
        Config::builder().url(Url::parse("https://meter.local").unwrap()).protocol(protocol).build()
    }

    fn anonymous(protocol: Protocol, transport: &Arc<MockTransport>) -> Result<Client> {
        Client::builder().config(config(protocol)).transport(transport.clone()).build()
    }

    fn authenticated(protocol: Protocol, transport: &Arc<MockTransport>) -> Result<Client> {
        let config = Config {
            username: Some("owner".into()),
            password: Some("secret".into()),
            ..config(protocol)
        };
        Client::builder().config(config).transport(transport.clone()).build()
    }

    fn xml_device() -> Arc<MockTransport> {
        Arc::new(MockTransport::new(|request| match request.path() {
            "/cgi-bin/egauge" => Response::new(StatusCode::OK, INSTANTANEOUS),
            "/cgi-bin/egauge-show" if request.query.as_deref() == Some("a&n=1&S") => {
                Response::new(StatusCode::OK, REGISTER_LIST)
            }
            "/cgi-bin/egauge-show" => Response::new(StatusCode::OK, HISTORY),
            _ => Response::new(StatusCode::NOT_FOUND, ""),
        }))
    }

    /// XML device whose first `n_partial` historical register lists lack `use`.
    fn xml_device_missing_use(n_partial: usize) -> (Arc<MockTransport>, Arc<AtomicUsize>) {
        let n_discoveries = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&n_discoveries);
        let transport = Arc::new(MockTransport::new(move |request| {
            if request.query.as_deref() == Some("a&n=1&S") {
                if counter.fetch_add(1, Ordering::SeqCst) < n_partial {
                    Response::new(StatusCode::OK, PARTIAL_REGISTER_LIST)
                } else {
                    Response::new(StatusCode::OK, REGISTER_LIST)
                }
            } else {
                Response::new(StatusCode::OK, HISTORY)
            }
        }));
        (transport, n_discoveries)
    }

    /// Parameters of the latest XML history request.
    fn last_history_query(transport: &MockTransport) -> IndexMap<String, String> {
        let request = transport.requests().pop().unwrap();
        assert_eq!(request.path(), "/cgi-bin/egauge-show");
        request
            .query
            .unwrap()
            .split('&')
            .map(|param| {
                let (name, value) = param.split_once('=').unwrap_or((param, ""));
                (name.to_owned(), value.to_owned())
            })
            .collect()
    }

    /// JSON device accepting any bearer token, with the login counter.
    fn json_device() -> (Arc<MockTransport>, Arc<AtomicUsize>) {
        let n_logins = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&n_logins);
        let transport = Arc::new(MockTransport::new(move |request| {
            let query = request.query.as_deref().unwrap_or_default();
            match request.path() {
                "/api/auth/unauthorized" => Response::new(
                    StatusCode::UNAUTHORIZED,
                    r#"{"rlm": "eGauge Administration", "nnc": "server-nonce"}"#,
                ),
                "/api/auth/login" => {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    let jwt = make_jwt(Utc::now().timestamp(), 600, n);
                    Response::new(StatusCode::OK, serde_json::json!({"jwt": jwt}).to_string())
                }
                "/api/auth/logout" => Response::new(StatusCode::OK, "{}"),
                _ if !request.headers.contains_key(AUTHORIZATION) => {
                    Response::new(StatusCode::UNAUTHORIZED, "")
                }
                "/api/register" if query.is_empty() => {
                    Response::new(StatusCode::OK, JSON_REGISTERS)
                }
                "/api/register" if query.starts_with("rate") => {
                    Response::new(StatusCode::OK, JSON_RATES)
                }
                "/api/register" => Response::new(StatusCode::OK, JSON_HISTORY),
                _ => Response::new(StatusCode::NOT_FOUND, ""),
            }
        }));
        (transport, n_logins)
    }

    #[tokio::test]
    async fn xml_current_measurements() -> Result {
        let transport = xml_device();
        let client = anonymous(Protocol::Xml, &transport)?;

        let row = client.get_current_measurements(Some(&["Solar", "Grid"][..])).await?;
        assert_eq!(row.names().collect_vec(), ["Grid", "Solar"]);
        assert_eq!(row.registers["Grid"].value, 10_007_200.0);
        assert_eq!(row.registers["Solar"].rate, Some(-120.0));
        assert_eq!(row.registers["Grid"].descriptor.database_id, Some(0));

        let rates = client.get_current_rates(None).await?;
        assert_eq!(rates.keys().collect_vec(), ["Grid", "Solar"]);

        // One discovery and two snapshots.
        assert_eq!(transport.count("/cgi-bin/egauge"), 3);
        assert_eq!(transport.requests()[0].target(), "/cgi-bin/egauge?inst&tot");
        Ok(())
    }

    #[tokio::test]
    async fn unknown_register_refreshes_once() -> Result {
        let transport = xml_device();
        let client = anonymous(Protocol::Xml, &transport)?;
        let result = client.get_current_measurements(Some(&["Wind"][..])).await;
        assert!(matches!(result, Err(Error::UnknownRegister(name)) if name == "Wind"));
        assert_eq!(transport.count("/cgi-bin/egauge"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_range_makes_no_requests() -> Result {
        let transport = xml_device();
        let client = anonymous(Protocol::Xml, &transport)?;
        let at = newest();

        let result = client.get_historical_series(at, at, TimeInterval::Hour, None).await;
        assert!(matches!(result, Err(Error::InvalidRange { .. })));
        let result = client
            .get_interval_changes(
                at,
                at - TimeDelta::hours(1),
                TimeInterval::Hour,
                Some(&["Grid"][..]),
            )
            .await;
        assert!(matches!(result, Err(Error::InvalidRange { .. })));

        assert!(transport.requests().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn xml_history() -> Result {
        let transport = xml_device();
        let client = anonymous(Protocol::Xml, &transport)?;
        let end = newest();
        let start = end - TimeDelta::hours(2);

        let query = HistoricalQuery::builder()
            .start(start)
            .end(end)
            .interval(TimeInterval::Hour)
            .registers(vec!["Grid".to_owned()])
            .skip(1)
            .max_rows(10)
            .build();
        let rows = client.query_history(&query).await?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].timestamp, start);
        assert_eq!(rows[0].names().collect_vec(), ["Grid"]);
        assert_eq!(rows[2].registers["Grid"].value, 10_007_200.0);

        let requests = transport.requests();
        assert_eq!(requests[0].target(), "/cgi-bin/egauge-show?a&n=1&S");
        assert_eq!(
            requests[1].target(),
            format!(
                "/cgi-bin/egauge-show?a&t={}&f={}&h&s=1&n=10",
                start.timestamp(),
                end.timestamp(),
            ),
        );
        Ok(())
    }

    #[tokio::test]
    async fn xml_interval_changes_accept_both_namespaces() -> Result {
        let transport = xml_device();
        let client = anonymous(Protocol::Xml, &transport)?;
        let end = newest();

        let changes = client
            .get_interval_changes(
                end - TimeDelta::hours(2),
                end,
                TimeInterval::Hour,
                Some(&["Grid", "Total Usage"][..]),
            )
            .await?;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].end, end);
        assert_eq!(changes[0].rates.keys().collect_vec(), ["Grid", "Total Usage"]);
        assert_eq!(changes[0].rate("Grid"), Some(1.0));
        assert_eq!(changes[1].rate("Total Usage"), Some(10.0));

        let names = client.name_map().await?;
        assert_eq!(names.to_historical("Total Usage"), Some("use"));
        Ok(())
    }

    #[tokio::test]
    async fn xml_interval_changes_of_all_registers() -> Result {
        let transport = xml_device();
        let client = anonymous(Protocol::Xml, &transport)?;
        let end = newest();

        let start = end - TimeDelta::hours(2);

        let changes = client.get_interval_changes(start, end, TimeInterval::Hour, None).await?;
        assert_eq!(changes.len(), 2);
        for change in &changes {
            assert_eq!(change.rates.keys().collect_vec(), ["Grid", "Solar", "use"]);
            assert_eq!(change.rate("Grid"), Some(1.0));
            assert_eq!(change.rate("Solar"), Some(2.0));
            assert_eq!(change.rate("use"), Some(10.0));
        }
        Ok(())
    }

    #[tokio::test]
    async fn xml_interval_changes_skip_rows() -> Result {
        let transport = xml_device();
        let client = anonymous(Protocol::Xml, &transport)?;
        let end = newest();
        let start = end - TimeDelta::hours(4);

        let query = HistoricalQuery::builder()
            .start(start)
            .end(end)
            .interval(TimeInterval::Hour)
            .registers(vec!["Total Usage".to_owned()])
            .skip(1)
            .build();
        let changes = client.query_interval_changes(&query).await?;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].rate("Total Usage"), Some(10.0));
        assert_eq!(
            transport.requests().last().unwrap().target(),
            format!(
                "/cgi-bin/egauge-show?a&t={}&f={}&h&s=1",
                start.timestamp(),
                end.timestamp(),
            ),
        );
        Ok(())
    }

    #[tokio::test]
    async fn recent_changes_reach_one_span_back() -> Result {
        let transport = xml_device();
        let client = anonymous(Protocol::Xml, &transport)?;
        let span = |query: &IndexMap<String, String>| {
            query["f"].parse::<i64>().unwrap() - query["t"].parse::<i64>().unwrap()
        };

        let changes = client.get_hourly_changes(2, Some(&["Grid"][..])).await?;
        assert_eq!(changes.len(), 2);
        let query = last_history_query(&transport);
        assert_eq!(span(&query), 3 * 3600);
        assert!(query.contains_key("h"));
        assert!(!query.contains_key("s"));

        client.get_daily_changes(1, None).await?;
        let query = last_history_query(&transport);
        assert_eq!(span(&query), 2 * 86400);
        assert!(query.contains_key("d"));
        assert!(!query.contains_key("s"));

        client.get_weekly_changes(4, None).await?;
        let query = last_history_query(&transport);
        assert_eq!(span(&query), 5 * 7 * 86400);
        assert!(query.contains_key("d"));
        assert_eq!(query["s"], "6");
        Ok(())
    }

    #[tokio::test]
    async fn xml_history_at_timestamps() -> Result {
        let transport = xml_device();
        let client = anonymous(Protocol::Xml, &transport)?;
        let end = newest();
        let start = end - TimeDelta::hours(2);

        let query = HistoricalQuery::builder()
            .start(start)
            .end(end)
            .interval(TimeInterval::Hour)
            .timestamps(vec![start, end])
            .build();
        let rows = client.query_history(&query).await?;
        assert_eq!(rows.len(), 3);
        assert_eq!(
            transport.requests().last().unwrap().target(),
            format!(
                "/cgi-bin/egauge-show?a&t={start}&f={end}&h&T={end}%2C{start}",
                start = start.timestamp(),
                end = end.timestamp(),
            ),
        );
        Ok(())
    }

    #[tokio::test]
    async fn register_missing_from_first_discovery_is_rediscovered() -> Result {
        let (transport, n_discoveries) = xml_device_missing_use(1);
        let client = anonymous(Protocol::Xml, &transport)?;
        let end = newest();

        let start = end - TimeDelta::hours(2);

        let rows = client.get_historical_series(start, end, TimeInterval::Hour, None).await?;
        assert_eq!(rows[0].names().collect_vec(), ["Grid", "Solar", "use"]);
        assert_eq!(n_discoveries.load(Ordering::SeqCst), 2);
        assert!(client.get_historical_registers().await?.contains_key("use"));
        Ok(())
    }

    #[tokio::test]
    async fn register_missing_from_every_discovery_is_unknown() -> Result {
        let (transport, n_discoveries) = xml_device_missing_use(usize::MAX);
        let client = anonymous(Protocol::Xml, &transport)?;
        let end = newest();

        let start = end - TimeDelta::hours(2);

        let result = client.get_historical_series(start, end, TimeInterval::Hour, None).await;
        assert!(matches!(result, Err(Error::UnknownRegister(name)) if name == "use"));
        assert_eq!(n_discoveries.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn xml_open_device_is_not_asked_twice() -> Result {
        let transport = xml_device();
        let client = authenticated(Protocol::Xml, &transport)?;
        let row = client.get_current_measurements(None).await?;
        assert_eq!(row.registers.len(), 3);

        // One snapshot and one discovery.
        assert_eq!(transport.count("/cgi-bin/egauge"), 2);
        let requests = transport.requests();
        assert!(requests.iter().all(|request| !request.headers.contains_key(AUTHORIZATION)));
        Ok(())
    }

    #[tokio::test]
    async fn xml_digest_challenge() -> Result {
        let transport = Arc::new(MockTransport::new(|request| {
            if request.headers.contains_key(AUTHORIZATION) {
                Response::new(StatusCode::OK, INSTANTANEOUS)
            } else {
                with_header(
                    Response::new(StatusCode::UNAUTHORIZED, ""),
                    WWW_AUTHENTICATE,
                    r#"Digest realm="eGauge Administration", nonce="abc", qop="auth""#,
                )
            }
        }));
        let client = authenticated(Protocol::Xml, &transport)?;
        let row = client.get_current_measurements(None).await?;
        assert_eq!(row.registers.len(), 3);
        assert!(matches!(client.session_phase().await, SessionPhase::Digest(_)));

        let anonymous_requests = transport
            .requests()
            .iter()
            .filter(|request| !request.headers.contains_key(AUTHORIZATION))
            .count();
        assert_eq!(anonymous_requests, 1);
        Ok(())
    }

    #[tokio::test]
    async fn json_concurrent_requests_log_in_once() -> Result {
        let (transport, n_logins) = json_device();
        let client = authenticated(Protocol::Json, &transport)?;

        let calls = (0..10).map(|_| client.get_current_rates(Some(&["Grid"][..])));
        for rates in join_all(calls).await {
            assert_eq!(rates?.into_iter().collect_vec(), [("Grid".to_owned(), 1798.5)]);
        }
        assert_eq!(n_logins.load(Ordering::SeqCst), 1);
        assert_eq!(transport.count("/api/auth/unauthorized"), 1);

        let requests = transport.requests();
        let discoveries = requests
            .iter()
            .filter(|request| request.path() == "/api/register" && request.query.is_none())
            .count();
        assert_eq!(discoveries, 1);
        assert_eq!(requests.last().unwrap().target(), "/api/register?rate&reg=none%2B17");
        Ok(())
    }

    #[tokio::test]
    async fn authenticate_ahead_and_invalidate() -> Result {
        let (transport, n_logins) = json_device();
        let client = authenticated(Protocol::Json, &transport)?;
        assert_eq!(client.session_phase().await, SessionPhase::Token(TokenPhase::NoToken));

        client.authenticate().await?;
        assert_eq!(client.session_phase().await, SessionPhase::Token(TokenPhase::Valid));
        client.get_current_measurements(None).await?;
        assert_eq!(n_logins.load(Ordering::SeqCst), 1);

        client.invalidate_session().await;
        assert_eq!(client.session_phase().await, SessionPhase::Token(TokenPhase::NoToken));
        client.get_current_measurements(None).await?;
        assert_eq!(n_logins.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn json_history() -> Result {
        let (transport, _) = json_device();
        let client = authenticated(Protocol::Json, &transport)?;
        let end = Utc.timestamp_opt(1_678_298_400, 0).unwrap();
        let start = end - TimeDelta::minutes(10);

        let query = HistoricalQuery::builder()
            .start(start)
            .end(end)
            .interval(TimeInterval::Minute)
            .registers(vec!["Grid".to_owned()])
            .skip(1)
            .max_rows(5)
            .build();
        let rows = client.query_history(&query).await?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, end - TimeDelta::minutes(2));
        assert_eq!(rows[1].registers["Grid"].value, 10_003_600.0);
        assert_eq!(
            transport.requests().last().unwrap().target(),
            format!(
                "/api/register?time={}%3A120%3A{}&reg=none%2B17&max-rows=5",
                start.timestamp(),
                end.timestamp(),
            ),
        );

        let query = HistoricalQuery::builder()
            .start(start)
            .end(end)
            .interval(TimeInterval::Minute)
            .timestamps(vec![start, end])
            .build();
        client.query_history(&query).await?;
        assert_eq!(
            transport.requests().last().unwrap().target(),
            format!("/api/register?time={}%2C{}", end.timestamp(), start.timestamp()),
        );
        Ok(())
    }

    #[tokio::test]
    async fn error_statuses() -> Result {
        let transport = Arc::new(MockTransport::new(|request| match request.path() {
            "/cgi-bin/egauge" => Response::new(StatusCode::FORBIDDEN, ""),
            _ => Response::new(StatusCode::INTERNAL_SERVER_ERROR, ""),
        }));
        let client = anonymous(Protocol::Xml, &transport)?;
        assert!(matches!(client.get_current_measurements(None).await, Err(Error::Permission(_))));
        assert!(matches!(
            client.get_historical_registers().await,
            Err(Error::Status { status: StatusCode::INTERNAL_SERVER_ERROR, .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn scoped_closes_on_success() -> Result {
        let (transport, _) = json_device();
        let client = authenticated(Protocol::Json, &transport)?;
        let rates =
            client.scoped(|client| async move { client.get_current_rates(None).await }).await?;
        assert_eq!(rates.len(), 2);
        assert_eq!(transport.count("/api/auth/logout"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn scoped_closes_on_error() -> Result {
        let (transport, _) = json_device();
        let client = authenticated(Protocol::Json, &transport)?;
        let result = client
            .scoped(|client| async move {
                client.get_current_measurements(Some(&["Wind"][..])).await.map(drop)
            })
            .await;
        assert!(matches!(result, Err(Error::UnknownRegister(_))));
        assert_eq!(transport.count("/api/auth/logout"), 1);
        Ok(())
    }
}
