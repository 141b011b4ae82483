#![doc = include_str!("../README.md")]

mod client;
mod config;
mod delta;
mod error;
mod model;
mod names;
mod parse;
mod prelude;
mod query;
mod registers;
mod session;
mod single_flight;
mod transport;

pub use self::{
    client::{Client, HistoricalQuery},
    config::{Config, Protocol},
    delta::{IntervalChange, interval_changes},
    error::{CounterDiscontinuity, Error, ParseError, TransportError},
    model::{
        DataKind,
        DataRow,
        RegisterDescriptor,
        RegisterSample,
        RegisterType,
        Registers,
        TimeInterval,
    },
    names::NameMap,
    parse::{JsonParser, ResponseParser, XmlParser},
    query::{Query, QueryParam},
    session::{DigestPhase, SessionPhase, TokenPhase},
    transport::{HttpTransport, Request, Response, Transport},
};

pub type Result<T = (), E = Error> = std::result::Result<T, E>;
