//! Slurm hostlist expressions.
//!
//! A hostlist is a comma separated list of host patterns, where each pattern may contain
//! bracketed ranges, e.g. `gpu-[01-03,7],cpu-[1-2]-[a,b]`.

use thiserror::Error;

/// The maximum number of hosts a single hostlist may expand to.
pub const MAX_HOSTS: usize = 65536;

/// Errors from parsing a hostlist expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostlistError {
    #[error("unbalanced brackets in hostlist {0:?}")]
    Unbalanced(String),
    #[error("invalid range {range:?} in hostlist {hostlist:?}")]
    InvalidRange { hostlist: String, range: String },
    #[error("hostlist {0:?} expands to more than 65536 hosts")]
    TooLarge(String),
}

/// Expand the given hostlist expression into its host names, in order.
pub fn expand(hostlist: &str) -> Result<Vec<String>, HostlistError> {
    let mut hosts = Vec::new();
    for pattern in split_top_level(hostlist)? {
        if pattern.is_empty() {
            continue;
        }
        let expanded = expand_pattern(hostlist, pattern)?;
        if hosts.len() + expanded.len() > MAX_HOSTS {
            return Err(HostlistError::TooLarge(hostlist.into()));
        }
        hosts.extend(expanded);
    }
    Ok(hosts)
}

/// Split on commas which are not inside of brackets.
fn split_top_level(hostlist: &str) -> Result<Vec<&str>, HostlistError> {
    let mut parts = Vec::new();
    let (mut depth, mut start) = (0usize, 0usize);
    for (idx, c) in hostlist.char_indices() {
        match c {
            '[' if depth == 0 => depth = 1,
            '[' => return Err(HostlistError::Unbalanced(hostlist.into())),
            ']' if depth == 1 => depth = 0,
            ']' => return Err(HostlistError::Unbalanced(hostlist.into())),
            ',' if depth == 0 => {
                parts.push(hostlist[start..idx].trim());
                start = idx + 1;
            }
            _ => (),
        }
    }
    if depth != 0 {
        return Err(HostlistError::Unbalanced(hostlist.into()));
    }
    parts.push(hostlist[start..].trim());
    Ok(parts)
}

/// Expand a single pattern, which may carry any number of bracket groups.
fn expand_pattern(hostlist: &str, pattern: &str) -> Result<Vec<String>, HostlistError> {
    let open = match pattern.find('[') {
        Some(open) => open,
        None => return Ok(vec![pattern.to_string()]),
    };
    let close = pattern[open..]
        .find(']')
        .map(|offset| open + offset)
        .ok_or_else(|| HostlistError::Unbalanced(hostlist.into()))?;
    let (prefix, body, rest) = (&pattern[..open], &pattern[open + 1..close], &pattern[close + 1..]);

    let suffixes = expand_pattern(hostlist, rest)?;
    let mut hosts = Vec::new();
    for item in body.split(',') {
        let values = expand_range(hostlist, item.trim())?;
        if hosts.len().saturating_add(values.len().saturating_mul(suffixes.len())) > MAX_HOSTS {
            return Err(HostlistError::TooLarge(hostlist.into()));
        }
        for value in values {
            for suffix in suffixes.iter() {
                hosts.push(format!("{}{}{}", prefix, value, suffix));
            }
        }
    }
    Ok(hosts)
}

/// Expand a single bracket item, either `N`, `N-M` or a literal.
fn expand_range(hostlist: &str, item: &str) -> Result<Vec<String>, HostlistError> {
    let invalid = || HostlistError::InvalidRange {
        hostlist: hostlist.into(),
        range: item.into(),
    };
    if item.is_empty() {
        return Err(invalid());
    }
    let (low, high) = match item.split_once('-') {
        Some((low, high)) => (low, high),
        None => return Ok(vec![item.to_string()]),
    };
    let width = low.len();
    let low_val: u64 = low.parse().map_err(|_| invalid())?;
    let high_val: u64 = high.parse().map_err(|_| invalid())?;
    if high_val < low_val {
        return Err(invalid());
    }
    if high_val - low_val >= MAX_HOSTS as u64 {
        return Err(HostlistError::TooLarge(hostlist.into()));
    }
    Ok((low_val..=high_val).map(|val| format!("{:0width$}", val, width = width)).collect())
}
