//! Text records emitted by the companion traffic client.
//!
//! Each record is one line: `SEQ=<n>|TS=<unix_time>|DATA=<payload>\n`.
//! The proxy itself never looks at these; they exist so a downstream consumer
//! can detect gaps, duplicates and reordering introduced on the path.

use std::fmt;
use std::str::FromStr;

use crate::error::ProxyError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub seq: u64,
    pub timestamp: i64,
    pub payload: String,
}

impl Record {
    pub fn new(seq: u64, timestamp: i64, payload: impl Into<String>) -> Self {
        Self {
            seq,
            timestamp,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parses one line, with or without its trailing newline.
    pub fn parse(line: &str) -> Result<Self, ProxyError> {
        line.parse()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SEQ={}|TS={}|DATA={}", self.seq, self.timestamp, self.payload)
    }
}

impl FromStr for Record {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.strip_suffix('\n').unwrap_or(s);
        let line = line.strip_suffix('\r').unwrap_or(line);

        let mut fields = line.splitn(3, '|');
        let seq = field(fields.next(), "SEQ=")?;
        let ts = field(fields.next(), "TS=")?;
        let payload = field(fields.next(), "DATA=")?;

        Ok(Self {
            seq: seq
                .parse()
                .map_err(|_| invalid(format!("bad sequence number '{}'", seq)))?,
            timestamp: ts
                .parse()
                .map_err(|_| invalid(format!("bad timestamp '{}'", ts)))?,
            payload: payload.to_string(),
        })
    }
}

fn field<'a>(raw: Option<&'a str>, prefix: &str) -> Result<&'a str, ProxyError> {
    raw.and_then(|f| f.strip_prefix(prefix))
        .ok_or_else(|| invalid(format!("missing {} field", prefix.trim_end_matches('='))))
}

fn invalid(msg: String) -> ProxyError {
    ProxyError::InvalidRecord(msg)
}

/// Produces consecutive records starting at sequence number 1.
#[derive(Debug, Clone)]
pub struct RecordSequence {
    next_seq: u64,
    payload: String,
}

impl RecordSequence {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            next_seq: 1,
            payload: payload.into(),
        }
    }

    pub fn next_record(&mut self, timestamp: i64) -> Record {
        let record = Record::new(self.next_seq, timestamp, self.payload.clone());
        self.next_seq += 1;
        record
    }
}
