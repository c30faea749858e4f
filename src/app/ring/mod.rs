// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The token ring: the cyclic token space the store is partitioned over.
//!
//! A [`Token`] is an opaque, totally-ordered point in a fixed `i64` space.
//! A [`Range`] is the half-open arc `(start, end]` between two tokens, the
//! unit of data ownership used throughout bootstrap.

use serde::{
    Deserialize,
    Serialize,
};
use std::{
    fmt,
    str::FromStr,
};
use thiserror::Error;

/// A position on the ring. Ordering is the natural order of the underlying
/// `i64`; wrap-around is expressed through [`Range`], not through `Token`
/// itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

/// Error returned when a token string cannot be parsed.
#[derive(Debug, Error)]
#[error("malformed token: {0}")]
pub struct TokenParseError(String);

impl Token {
    /// The minimum token in the space.
    pub const MIN: Token = Token(i64::MIN);
    /// The maximum token in the space.
    pub const MAX: Token = Token(i64::MAX);

    /// The token immediately following this one, wrapping at [`Token::MAX`].
    pub fn successor(self) -> Token {
        if self.0 == i64::MAX {
            Token(i64::MIN)
        } else {
            Token(self.0 + 1)
        }
    }

    /// The token immediately preceding this one, wrapping at [`Token::MIN`].
    pub fn predecessor(self) -> Token {
        if self.0 == i64::MIN {
            Token(i64::MAX)
        } else {
            Token(self.0 - 1)
        }
    }

    /// The midpoint between `self` (exclusive) and `end` (inclusive),
    /// following the ring forward from `self` to `end`, wrapping through
    /// [`Token::MAX`]/[`Token::MIN`] if `end <= self`.
    ///
    /// This is the token the source side of `getSplits(2)` hands back: the
    /// point that splits the arc `(self, end]` into two roughly-equal
    /// halves.
    pub fn midpoint(self, end: Token) -> Token {
        let span = self.distance_to(end) as i128;
        let half = span / 2;
        Token(((self.0 as i128 + half) % (1i128 << 64)) as i64)
    }

    /// Forward distance from `self` to `other`, following the ring in the
    /// direction of increasing token, wrapping through the zero point.
    /// Always in `1..=u64::MAX` (zero only when `self == other`, treated
    /// as "all the way around").
    pub fn distance_to(self, other: Token) -> u64 {
        other.0.wrapping_sub(self.0) as u64
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Token {
    type Err = TokenParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Token)
            .map_err(|_| TokenParseError(s.to_owned()))
    }
}

/// A half-open arc `(start, end]` on the ring. May wrap through the ring's
/// zero point (when `end <= start` numerically, the arc still runs forward
/// from `start` through [`Token::MAX`]/[`Token::MIN`] to `end`).
///
/// Invariant: `start != end` — a range covering the whole ring is not
/// representable by this type (mirrors the source system, which never
/// constructs such a range because at least one token always exists).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Range {
    start: Token,
    end: Token,
}

/// Error returned when constructing a [`Range`] with equal endpoints.
#[derive(Debug, Error)]
#[error("range endpoints must differ, got {0:?} for both start and end")]
pub struct DegenerateRangeError(Token);

impl Range {
    /// Construct `(start, end]`. Fails if `start == end`.
    pub fn new(start: Token, end: Token) -> Result<Self, DegenerateRangeError> {
        if start == end {
            return Err(DegenerateRangeError(start));
        }
        Ok(Self { start, end })
    }

    /// The exclusive lower bound.
    pub fn start(&self) -> Token {
        self.start
    }

    /// The inclusive upper bound.
    pub fn end(&self) -> Token {
        self.end
    }

    /// True if this range wraps through the ring's zero point, i.e. `end`
    /// does not numerically follow `start`.
    pub fn wraps(&self) -> bool {
        self.end.0 <= self.start.0
    }

    /// True if `token` falls within `(start, end]`.
    pub fn contains(&self, token: Token) -> bool {
        if self.wraps() {
            token.0 > self.start.0 || token.0 <= self.end.0
        } else {
            token.0 > self.start.0 && token.0 <= self.end.0
        }
    }

    /// Split this range at `token`, which must lie strictly inside it,
    /// into `(start, token]` and `(token, end]`. Returns `None` if `token`
    /// is not contained in the range or coincides with either endpoint.
    pub fn split(&self, token: Token) -> Option<(Range, Range)> {
        if !self.contains(token) || token == self.start || token == self.end {
            return None;
        }
        Some((Range { start: self.start, end: token }, Range { start: token, end: self.end }))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}]", self.start, self.end)
    }
}
