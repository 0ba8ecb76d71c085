// Copyright (c) The nah Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use either::Either;
use once_cell::sync::OnceCell;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::{error, fmt, str::FromStr};

/// A version range over [SemVer 2.0.0](https://semver.org) versions.
///
/// The range language is a disjunction of comparator sets: comparator sets are
/// separated by `||`, and within a set, space-separated comparators are all
/// required to hold. Each comparator is one of `=`, `<`, `<=`, `>`, `>=`
/// followed by a full version. `>=3.1.0 <4.0.0 || =5.0.0` reads "at least
/// 3.1.0 and below 4.0.0, or exactly 5.0.0".
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeSet {
    sets: Vec<Vec<Comparator>>,
}

impl RangeSet {
    /// Parses a range expression. Surrounding whitespace is trimmed.
    pub fn parse(input: &str) -> Result<Self, ParseRangeError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ParseRangeError::new(input, "range expression is empty"));
        }

        let mut sets = Vec::new();
        for set_str in trimmed.split("||") {
            let set_str = set_str.trim();
            if set_str.is_empty() {
                return Err(ParseRangeError::new(input, "empty comparator set"));
            }
            let mut comparators = Vec::new();
            for token in set_str.split_whitespace() {
                comparators.push(Comparator::parse(token).map_err(|err| err.with_input(input))?);
            }
            sets.push(comparators);
        }

        Ok(Self { sets })
    }

    /// Returns true if `version` satisfies this range: all comparators of at
    /// least one set hold. Precedence follows SemVer 2.0.0 (build metadata is
    /// ignored; pre-releases order below their release).
    pub fn satisfies(&self, version: &Version) -> bool {
        self.sets
            .iter()
            .any(|set| set.iter().all(|cmp| cmp.matches(version)))
    }

    /// Returns `"MAJOR.MINOR"` of the lower bound of the first comparator
    /// set's minimum satisfying version. A set with no lower bound keys as
    /// `"0.0"`.
    pub fn selection_key(&self) -> String {
        let first = match self.sets.first() {
            Some(set) => set,
            None => return "0.0".to_owned(),
        };
        let mut lower: Option<&Version> = None;
        for cmp in first {
            let candidate = match cmp.op {
                CompOp::Eq | CompOp::Gt | CompOp::Ge => &cmp.version,
                CompOp::Lt | CompOp::Le => continue,
            };
            match lower {
                Some(current) if current.cmp_precedence(candidate).is_ge() => {}
                _ => lower = Some(candidate),
            }
        }
        match lower {
            Some(version) => format!("{}.{}", version.major, version.minor),
            None => "0.0".to_owned(),
        }
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, set) in self.sets.iter().enumerate() {
            if i > 0 {
                write!(f, " || ")?;
            }
            for (j, cmp) in set.iter().enumerate() {
                if j > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", cmp)?;
            }
        }
        Ok(())
    }
}

impl FromStr for RangeSet {
    type Err = ParseRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A single comparison against a version.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Comparator {
    pub op: CompOp,
    pub version: Version,
}

/// The comparison operators the range language admits. Caret, tilde and
/// wildcard requirements are not part of the language and fail to parse.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    fn parse(token: &str) -> Result<Self, ParseRangeError> {
        let (op, rest) = if let Some(rest) = token.strip_prefix(">=") {
            (CompOp::Ge, rest)
        } else if let Some(rest) = token.strip_prefix("<=") {
            (CompOp::Le, rest)
        } else if let Some(rest) = token.strip_prefix('>') {
            (CompOp::Gt, rest)
        } else if let Some(rest) = token.strip_prefix('<') {
            (CompOp::Lt, rest)
        } else if let Some(rest) = token.strip_prefix('=') {
            (CompOp::Eq, rest)
        } else {
            return Err(ParseRangeError::new(
                token,
                "comparator must begin with one of =, <, <=, >, >=",
            ));
        };

        let version = rest.parse::<Version>().map_err(|err| ParseRangeError {
            input: token.to_owned(),
            err: Either::Left(err),
        })?;
        Ok(Self { op, version })
    }

    fn matches(&self, version: &Version) -> bool {
        let ordering = version.cmp_precedence(&self.version);
        match self.op {
            CompOp::Eq => ordering.is_eq(),
            CompOp::Lt => ordering.is_lt(),
            CompOp::Le => ordering.is_le(),
            CompOp::Gt => ordering.is_gt(),
            CompOp::Ge => ordering.is_ge(),
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self.op {
            CompOp::Eq => "=",
            CompOp::Lt => "<",
            CompOp::Le => "<=",
            CompOp::Gt => ">",
            CompOp::Ge => ">=",
        };
        write!(f, "{}{}", op, self.version)
    }
}

/// An error encountered while parsing a range expression.
#[derive(Debug)]
pub struct ParseRangeError {
    input: String,
    err: Either<semver::Error, &'static str>,
}

impl ParseRangeError {
    fn new(input: &str, msg: &'static str) -> Self {
        Self {
            input: input.to_owned(),
            err: Either::Right(msg),
        }
    }

    fn with_input(mut self, input: &str) -> Self {
        self.input = input.to_owned();
        self
    }
}

impl fmt::Display for ParseRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "could not parse version range '{}'", self.input)?;
        if let Either::Right(msg) = &self.err {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

impl error::Error for ParseRangeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.err {
            Either::Left(err) => Some(err),
            Either::Right(_) => None,
        }
    }
}

/// A runtime-kit version requirement as it appears in manifests and records:
/// the raw string is preserved, the parsed form is computed on demand.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct KitVersionReq {
    req: String,
    #[serde(skip)]
    parsed: OnceCell<Option<RangeSet>>,
}

impl KitVersionReq {
    /// Creates a requirement from a raw string without parsing it.
    pub fn new(req: impl Into<String>) -> Self {
        Self {
            req: req.into(),
            parsed: OnceCell::new(),
        }
    }

    /// Returns the requirement string.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.req
    }

    /// Returns the parsed range, if the string parses.
    pub fn as_range(&self) -> Option<&RangeSet> {
        self.parsed
            .get_or_init(|| RangeSet::parse(&self.req).ok())
            .as_ref()
    }

    /// Returns true if the requirement parses and `version` satisfies it.
    pub fn matches(&self, version: &Version) -> bool {
        self.as_range()
            .map_or(false, |range| range.satisfies(version))
    }
}

impl PartialEq for KitVersionReq {
    fn eq(&self, other: &Self) -> bool {
        self.req == other.req
    }
}

impl Eq for KitVersionReq {}

impl fmt::Display for KitVersionReq {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.req)
    }
}

impl From<RangeSet> for KitVersionReq {
    fn from(range: RangeSet) -> Self {
        Self {
            req: range.to_string(),
            parsed: OnceCell::from(Some(range)),
        }
    }
}

/// Parses a core `MAJOR.MINOR.PATCH` version: pre-release and build metadata
/// are rejected. NAK record versions must be in this form.
pub fn parse_core_version(input: &str) -> Result<Version, ParseRangeError> {
    let version = input
        .trim()
        .parse::<Version>()
        .map_err(|err| ParseRangeError {
            input: input.to_owned(),
            err: Either::Left(err),
        })?;
    if !version.pre.is_empty() || !version.build.is_empty() {
        return Err(ParseRangeError::new(
            input,
            "pre-release and build metadata are not allowed here",
        ));
    }
    Ok(version)
}
