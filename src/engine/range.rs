//! npm semver range expressions
//!
//! Supports npm range specifications:
//! - `1.2.3`, `=1.2.3`, `v1.2.3` - exact match
//! - `^1.2.3` - compatible with version (>=1.2.3 <2.0.0, narrower for 0.x)
//! - `~1.2.3` - approximately equivalent (>=1.2.3 <1.3.0)
//! - `>=1.2.3`, `>1.2.3`, `<=1.2.3`, `<1.2.3` - comparison operators
//! - `1.2.x`, `1.x`, `1.2`, `1`, `*`, empty - x-ranges
//! - `1.0.0 - 2.0.0` - hyphen ranges
//! - space (or comma) separated AND, `||` separated OR
//!
//! Every form is desugared into plain comparators, so matching is a simple
//! conjunction per `||` branch.

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use semver::{Prerelease, Version};

use crate::engine::error::ResolveError;

/// Operators followed by whitespace (`>= 1.2.3`) are glued to their operand
static OPERATOR_GAP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(>=|<=|>|<|=|~>|~|\^)\s+").expect("operator regex is valid")
});

/// Parse a version string leniently: strips a `v`/`=` prefix and pads
/// partial versions with zeros.
///
/// Examples:
/// - "1" -> Version(1, 0, 0)
/// - "v1.2" -> Version(1, 2, 0)
/// - "1.2.3-beta.1" -> Version(1, 2, 3-beta.1)
pub fn parse_version(version: &str) -> Option<Version> {
    let version = version
        .trim()
        .trim_start_matches('=')
        .trim_start_matches(['v', 'V']);
    let parts: Vec<&str> = version.split('.').collect();
    let normalized = match parts.len() {
        1 => format!("{}.0.0", parts[0]),
        2 => format!("{}.{}.0", parts[0], parts[1]),
        _ => version.to_string(),
    };
    Version::parse(&normalized).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Gt,
    Gte,
    Lt,
    Lte,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    /// A comparator no release can satisfy (`<0.0.0`)
    fn nothing() -> Self {
        Self::new(Op::Lt, Version::new(0, 0, 0))
    }

    fn matches(&self, version: &Version) -> bool {
        let ordering = version.cmp_precedence(&self.version);
        match self.op {
            Op::Eq => ordering.is_eq(),
            Op::Gt => ordering.is_gt(),
            Op::Gte => ordering.is_ge(),
            Op::Lt => ordering.is_lt(),
            Op::Lte => ordering.is_le(),
        }
    }
}

/// A possibly partial version such as `1`, `1.2`, `1.x` or `1.2.3-rc.1`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Prerelease,
}

impl Partial {
    fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim_start_matches(['v', 'V']);
        let spec = spec.split_once('+').map_or(spec, |(core, _build)| core);
        let (core, pre) = match spec.split_once('-') {
            Some((core, pre)) => (core, Prerelease::new(pre).ok().filter(|p| !p.is_empty())?),
            None => (spec, Prerelease::EMPTY),
        };

        if core.is_empty() {
            return Some(Self::any());
        }

        let mut numbers = [None; 3];
        let mut wildcard_seen = false;
        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return None;
        }
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            if matches!(*part, "x" | "X" | "*") {
                wildcard_seen = true;
                continue;
            }
            if wildcard_seen {
                return None;
            }
            *slot = Some(part.parse::<u64>().ok()?);
        }

        let [major, minor, patch] = numbers;
        if !pre.is_empty() && patch.is_none() {
            return None;
        }

        Some(Self {
            major,
            minor,
            patch,
            pre,
        })
    }

    fn any() -> Self {
        Self {
            major: None,
            minor: None,
            patch: None,
            pre: Prerelease::EMPTY,
        }
    }

    /// Lower bound with missing components filled with zeros
    fn floor(&self) -> Version {
        let mut version = Version::new(
            self.major.unwrap_or(0),
            self.minor.unwrap_or(0),
            self.patch.unwrap_or(0),
        );
        version.pre = self.pre.clone();
        version
    }

    fn full(&self) -> Option<Version> {
        self.patch.map(|_| self.floor())
    }

    /// First version above everything the partial covers
    /// (`1` -> `2.0.0`, `1.2` -> `1.3.0`); `None` for full or empty partials.
    fn ceiling(&self) -> Option<Version> {
        match (self.major, self.minor, self.patch) {
            (Some(major), None, _) => Some(Version::new(major.saturating_add(1), 0, 0)),
            (Some(major), Some(minor), None) => {
                Some(Version::new(major, minor.saturating_add(1), 0))
            }
            _ => None,
        }
    }
}

fn x_range(partial: &Partial) -> Vec<Comparator> {
    if partial.major.is_none() {
        return Vec::new();
    }
    match (partial.full(), partial.ceiling()) {
        (Some(exact), _) => vec![Comparator::new(Op::Eq, exact)],
        (None, Some(ceiling)) => vec![
            Comparator::new(Op::Gte, partial.floor()),
            Comparator::new(Op::Lt, ceiling),
        ],
        (None, None) => Vec::new(),
    }
}

fn tilde(partial: &Partial) -> Vec<Comparator> {
    let Some(major) = partial.major else {
        return Vec::new();
    };
    let upper = match partial.minor {
        Some(minor) => Version::new(major, minor.saturating_add(1), 0),
        None => Version::new(major.saturating_add(1), 0, 0),
    };
    vec![
        Comparator::new(Op::Gte, partial.floor()),
        Comparator::new(Op::Lt, upper),
    ]
}

fn caret(partial: &Partial) -> Vec<Comparator> {
    let Some(major) = partial.major else {
        return Vec::new();
    };
    let upper = match (major, partial.minor, partial.patch) {
        (0, Some(0), Some(patch)) => Version::new(0, 0, patch.saturating_add(1)),
        (0, Some(minor), _) => Version::new(0, minor.saturating_add(1), 0),
        (major, _, _) => Version::new(major.saturating_add(1), 0, 0),
    };
    vec![
        Comparator::new(Op::Gte, partial.floor()),
        Comparator::new(Op::Lt, upper),
    ]
}

fn primitive(op: Op, partial: &Partial) -> Vec<Comparator> {
    if partial.major.is_none() {
        return match op {
            Op::Gt | Op::Lt => vec![Comparator::nothing()],
            _ => Vec::new(),
        };
    }
    match (op, partial.full(), partial.ceiling()) {
        (Op::Eq, _, _) => x_range(partial),
        (op, Some(full), _) => vec![Comparator::new(op, full)],
        (Op::Gt, None, Some(ceiling)) => vec![Comparator::new(Op::Gte, ceiling)],
        (Op::Lte, None, Some(ceiling)) => vec![Comparator::new(Op::Lt, ceiling)],
        (op, _, _) => vec![Comparator::new(op, partial.floor())],
    }
}

fn hyphen(from: &Partial, to: &Partial) -> Vec<Comparator> {
    let mut comparators = Vec::new();
    if from.major.is_some() {
        comparators.push(Comparator::new(Op::Gte, from.floor()));
    }
    if to.major.is_some() {
        match (to.full(), to.ceiling()) {
            (Some(full), _) => comparators.push(Comparator::new(Op::Lte, full)),
            (None, Some(ceiling)) => comparators.push(Comparator::new(Op::Lt, ceiling)),
            (None, None) => {}
        }
    }
    comparators
}

fn parse_comparator(token: &str) -> Option<Vec<Comparator>> {
    let (op, rest) = if let Some(rest) = token.strip_prefix(">=") {
        (Some(Op::Gte), rest)
    } else if let Some(rest) = token.strip_prefix("<=") {
        (Some(Op::Lte), rest)
    } else if let Some(rest) = token.strip_prefix('>') {
        (Some(Op::Gt), rest)
    } else if let Some(rest) = token.strip_prefix('<') {
        (Some(Op::Lt), rest)
    } else if let Some(rest) = token.strip_prefix("~>") {
        return Partial::parse(rest).map(|p| tilde(&p));
    } else if let Some(rest) = token.strip_prefix('~') {
        return Partial::parse(rest).map(|p| tilde(&p));
    } else if let Some(rest) = token.strip_prefix('^') {
        return Partial::parse(rest).map(|p| caret(&p));
    } else if let Some(rest) = token.strip_prefix('=') {
        (Some(Op::Eq), rest)
    } else {
        (None, token)
    };

    let partial = Partial::parse(rest)?;
    Some(match op {
        Some(op) => primitive(op, &partial),
        None => x_range(&partial),
    })
}

fn parse_set(spec: &str) -> Option<Vec<Comparator>> {
    let spec = spec.replace(',', " ");
    let spec = OPERATOR_GAP.replace_all(spec.trim(), "$1");
    let tokens: Vec<&str> = spec.split_whitespace().collect();

    if let [from, "-", to] = tokens.as_slice() {
        return Some(hyphen(&Partial::parse(from)?, &Partial::parse(to)?));
    }

    let mut comparators = Vec::new();
    for token in tokens {
        comparators.extend(parse_comparator(token)?);
    }
    Some(comparators)
}

fn set_satisfies(set: &[Comparator], version: &Version) -> bool {
    if !set.iter().all(|c| c.matches(version)) {
        return false;
    }
    if version.pre.is_empty() {
        return true;
    }
    // Prereleases only match when a comparator opts into the same release line
    set.iter().any(|c| {
        !c.version.pre.is_empty()
            && c.version.major == version.major
            && c.version.minor == version.minor
            && c.version.patch == version.patch
    })
}

/// A parsed npm range: OR of AND-ed comparator sets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    sets: Vec<Vec<Comparator>>,
}

impl VersionRange {
    pub fn parse(spec: &str) -> Option<Self> {
        let sets: Option<Vec<_>> = spec.split("||").map(parse_set).collect();
        sets.map(|sets| Self { sets })
    }

    pub fn satisfies(&self, version: &Version) -> bool {
        self.sets.iter().any(|set| set_satisfies(set, version))
    }

    /// Whether any of the given version strings satisfies this range
    pub fn matches_any<'a, I>(&self, versions: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        versions
            .into_iter()
            .filter_map(|v| parse_version(v))
            .any(|v| self.satisfies(&v))
    }

    /// Highest-precedence version string satisfying this range
    pub fn max_satisfying<'a, I>(&self, versions: I) -> Option<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        versions
            .into_iter()
            .filter_map(|raw| Version::parse(raw).ok().map(|parsed| (raw, parsed)))
            .filter(|(_, parsed)| self.satisfies(parsed))
            .max_by(|(_, a), (_, b)| a.cmp_precedence(b))
            .map(|(raw, _)| raw)
    }
}

impl FromStr for VersionRange {
    type Err = ResolveError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        Self::parse(spec).ok_or_else(|| ResolveError::InvalidConstraint {
            constraint: spec.to_string(),
        })
    }
}
