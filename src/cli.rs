use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::app::Settings;
use crate::ports::PortRange;

/// Forward a contiguous range of TCP ports to a target host.
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    /// Source and destination port ranges
    #[arg(long, value_name = "SRC_START-SRC_END:DST_START-DST_END")]
    pub ports: PortRange,

    /// Host every connection is forwarded to
    #[arg(long, value_name = "HOST")]
    pub target: String,

    /// Host to listen on [default: every interface]
    #[arg(long, value_name = "HOST")]
    pub listen: Option<String>,

    /// Close a direction after it received no data for this long
    #[arg(long, value_name = "DURATION", default_value = "1m", value_parser = parse_timeout)]
    pub read_timeout: Duration,

    /// Close a connection if a single write takes longer than this
    #[arg(long, value_name = "DURATION", default_value = "1m", value_parser = parse_timeout)]
    pub write_timeout: Duration,

    /// Give up connecting to the target after this long
    #[arg(long, value_name = "DURATION", default_value = "5s", value_parser = parse_timeout)]
    pub connect_timeout: Duration,

    /// How often to log forwarding statistics
    #[arg(long, value_name = "DURATION", default_value = "5s", value_parser = parse_timeout)]
    pub stats_interval: Duration,
}

impl Cli {
    pub fn settings(&self) -> Settings {
        Settings {
            listen_host: self.listen.clone().unwrap_or_default(),
            target_host: self.target.clone(),
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            connect_timeout: self.connect_timeout,
            stats_interval: self.stats_interval,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseDurationError {
    #[error("empty duration")]
    Empty,

    #[error("expected a number in '{0}'")]
    ExpectedNumber(String),

    #[error("missing unit after '{0}', expected one of ms, s, m, h")]
    MissingUnit(String),

    #[error("unknown unit '{0}', expected one of ms, s, m, h")]
    UnknownUnit(String),

    #[error("duration is too large")]
    Overflow,

    #[error("duration must be greater than zero")]
    Zero,
}

// Syntax: 0 | (<integer><unit>)+ with unit one of ms, s, m, h
pub fn parse_duration(s: &str) -> Result<Duration, ParseDurationError> {
    use ParseDurationError::*;

    if s.is_empty() {
        return Err(Empty);
    }

    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;

    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(digits);

        if number.is_empty() {
            return Err(ExpectedNumber(s.to_owned()));
        }

        let units = tail.find(|c: char| c.is_ascii_digit()).unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(units);

        let value: u64 = number.parse().map_err(|_| Overflow)?;
        let millis_per_unit: u64 = match unit {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "" => return Err(MissingUnit(number.to_owned())),
            x => return Err(UnknownUnit(x.to_owned())),
        };

        let millis = value.checked_mul(millis_per_unit).ok_or(Overflow)?;
        total = total
            .checked_add(Duration::from_millis(millis))
            .ok_or(Overflow)?;

        rest = tail;
    }

    Ok(total)
}

fn parse_timeout(s: &str) -> Result<Duration, ParseDurationError> {
    match parse_duration(s)? {
        d if d.is_zero() => Err(ParseDurationError::Zero),
        d => Ok(d),
    }
}
