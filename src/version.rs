//! Instance version parsing and `Accept-Version` constraint matching.
//!
//! Instances advertise a free-form `x[.y[.z]][-suffix]` version string; the
//! catalog stores the parsed numeric triple with unparseable components
//! defaulting to zero. Requests may constrain candidates with forms like
//! `1.2`, `1.*`, `^1.2`, `~1.2.3` or `v2`.

use std::fmt;

/// Parses `x[.y[.z]][-suffix]` into `(major, minor, patch)`.
///
/// Each missing or unparseable component defaults to 0, so `"1.4.2-beta"`
/// yields `(1, 4, 2)` and `"2"` yields `(2, 0, 0)`.
pub fn parse_version(version: &str) -> (u32, u32, u32) {
    let numeric = version.split('-').next().unwrap_or("");
    let mut parts = numeric.split('.');
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.trim().parse::<u32>().ok())
            .unwrap_or(0)
    };
    (next(), next(), next())
}

/// One component of a version constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Part {
    /// Wildcard: matches anything.
    Any,
    Exact(u32),
    AtLeast(u32),
    /// Unparseable component: matches nothing.
    Never,
}

impl Part {
    fn matches(self, value: u32) -> bool {
        match self {
            Part::Any => true,
            Part::Exact(expected) => value == expected,
            Part::AtLeast(min) => value >= min,
            Part::Never => false,
        }
    }
}

/// A parsed `Accept-Version` constraint.
///
/// `^` promotes the minor component to a lower bound, `~` promotes the patch
/// component; `*` wildcards any component. Missing components are wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    major: Part,
    minor: Part,
    patch: Part,
}

impl VersionConstraint {
    /// Parses a constraint string. `"*"` (or empty) matches everything.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim().trim_start_matches('v');
        let caret = spec.starts_with('^');
        let tilde = spec.starts_with('~');
        let spec = spec.trim_start_matches(['^', '~']);

        let mut components: Vec<&str> = spec.split('.').collect();
        while components.len() < 3 {
            components.push("*");
        }

        let parse_part = |raw: &str, at_least: bool, ignore: bool| -> Part {
            let raw = raw.trim();
            if ignore || raw == "*" || raw.is_empty() {
                return Part::Any;
            }
            match raw.parse::<u32>() {
                Ok(value) if at_least => Part::AtLeast(value),
                Ok(value) => Part::Exact(value),
                Err(_) => Part::Never,
            }
        };

        VersionConstraint {
            major: parse_part(components[0], false, false),
            minor: parse_part(components[1], caret, false),
            // with `^` the patch component carries no constraint
            patch: parse_part(components[2], tilde, caret),
        }
    }

    pub fn matches(&self, major: u32, minor: u32, patch: u32) -> bool {
        self.major.matches(major) && self.minor.matches(minor) && self.patch.matches(patch)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |p: Part| match p {
            Part::Any => "*".to_string(),
            Part::Exact(v) => v.to_string(),
            Part::AtLeast(v) => format!(">={}", v),
            Part::Never => "!".to_string(),
        };
        write!(
            f,
            "{}.{}.{}",
            part(self.major),
            part(self.minor),
            part(self.patch)
        )
    }
}
