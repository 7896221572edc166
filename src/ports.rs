use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use thiserror::Error;

/// A source port range and the destination range it is forwarded to.
///
/// Both ranges are inclusive and always have the same length, so every
/// source port maps to exactly one destination port at a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    source_start: u16,
    source_end: u16,
    dest_start: u16,
    dest_end: u16,
}

impl PortRange {
    /// Number of forwarded ports.
    pub fn port_count(&self) -> usize {
        usize::from(self.source_end - self.source_start) + 1
    }

    /// Destination port `source` is forwarded to, `None` if `source` is
    /// outside the source range.
    pub fn dest_port(&self, source: u16) -> Option<u16> {
        (self.source_start..=self.source_end)
            .contains(&source)
            .then(|| self.dest_start + (source - self.source_start))
    }

    /// Every `(source, dest)` pair in the range, in ascending order.
    pub fn pairs(&self) -> impl Iterator<Item = (u16, u16)> + use<> {
        let range = *self;
        (self.source_start..=self.source_end)
            .filter_map(move |source| range.dest_port(source).map(|dest| (source, dest)))
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}:{}-{}",
            self.source_start, self.source_end, self.dest_start, self.dest_end
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("expected exactly one ':' between source and dest ranges")]
    ExpectedRangePair,

    #[error("invalid {0} range: expected <start>-<end>")]
    ExpectedStartEnd(Side),

    #[error("invalid {side} port '{value}': {source}")]
    InvalidPort {
        side: Side,
        value: String,
        source: ParseIntError,
    },

    #[error("invalid {side} port '{value}': expected a number")]
    NotANumber { side: Side, value: String },

    #[error("{0} start > {0} end")]
    Inverted(Side),

    #[error("source and dest ranges differ in length")]
    LengthMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Dest,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Dest => f.write_str("dest"),
        }
    }
}

fn parse_bounds(s: &str, side: Side) -> Result<(u16, u16), ParseError> {
    use ParseError::*;

    let mut tokens = s.split('-');
    let (Some(start), Some(end), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(ExpectedStartEnd(side));
    };

    let port = |value: &str| {
        if !value.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(NotANumber {
                side,
                value: value.to_owned(),
            });
        }

        value.parse::<u16>().map_err(|source| InvalidPort {
            side,
            value: value.to_owned(),
            source,
        })
    };

    let start = port(start)?;
    let end = port(end)?;

    if start > end {
        return Err(Inverted(side));
    }

    Ok((start, end))
}

impl FromStr for PortRange {
    type Err = ParseError;

    // Syntax: <start>-<end>:<start>-<end>
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split(':');
        let (Some(source), Some(dest), None) = (tokens.next(), tokens.next(), tokens.next()) else {
            return Err(ParseError::ExpectedRangePair);
        };

        let (source_start, source_end) = parse_bounds(source, Side::Source)?;
        let (dest_start, dest_end) = parse_bounds(dest, Side::Dest)?;

        if source_end - source_start != dest_end - dest_start {
            return Err(ParseError::LengthMismatch);
        }

        Ok(Self {
            source_start,
            source_end,
            dest_start,
            dest_end,
        })
    }
}
