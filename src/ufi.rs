// UFI generation

use eyre::{Result, eyre};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Literal prefix of every UFI
pub const UFI_PREFIX: &str = "UFI-";

const ALPHABET: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ALPHANUMERIC_LEN: usize = 10;
const NUMERIC_MIN: u32 = 100_000;
const NUMERIC_SPAN: u32 = 900_000;

/// Shape of the random suffix after the prefix
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdPolicy {
    /// 10 symbols from A-Z0-9, e.g. `UFI-7K2M9QX1AB`
    #[default]
    Alphanumeric,
    /// 6-digit number in 100000..=999999, e.g. `UFI-482913`
    Numeric,
}

impl IdPolicy {
    /// Whether `token` has the shape this policy generates
    pub fn matches(self, token: &str) -> bool {
        let Some(suffix) = token.strip_prefix(UFI_PREFIX) else {
            return false;
        };

        match self {
            IdPolicy::Alphanumeric => {
                suffix.len() == ALPHANUMERIC_LEN && suffix.bytes().all(|b| ALPHABET.contains(&b))
            }
            IdPolicy::Numeric => {
                suffix.len() == 6
                    && suffix.bytes().all(|b| b.is_ascii_digit())
                    && suffix.parse::<u32>().is_ok_and(|n| n >= NUMERIC_MIN)
            }
        }
    }

    /// Number of distinct tokens the policy can produce
    pub fn space_size(self) -> u64 {
        match self {
            IdPolicy::Alphanumeric => 36u64.pow(ALPHANUMERIC_LEN as u32),
            IdPolicy::Numeric => NUMERIC_SPAN as u64,
        }
    }
}

impl fmt::Display for IdPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdPolicy::Alphanumeric => write!(f, "alphanumeric"),
            IdPolicy::Numeric => write!(f, "numeric"),
        }
    }
}

impl FromStr for IdPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "alphanumeric" => Ok(IdPolicy::Alphanumeric),
            "numeric" => Ok(IdPolicy::Numeric),
            other => Err(format!("unknown id policy '{}' (expected alphanumeric or numeric)", other)),
        }
    }
}

/// Source of fresh identifiers
///
/// Implementations make no uniqueness promise; callers check against the store.
pub trait IdGenerator {
    fn generate(&self) -> Result<String>;
}

/// Generates UFIs from OS randomness
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGenerator {
    policy: IdPolicy,
}

impl RandomIdGenerator {
    pub fn new(policy: IdPolicy) -> Self {
        Self { policy }
    }
}

impl IdGenerator for RandomIdGenerator {
    fn generate(&self) -> Result<String> {
        let suffix = match self.policy {
            IdPolicy::Alphanumeric => alphanumeric_suffix()?,
            IdPolicy::Numeric => numeric_suffix()?.to_string(),
        };
        Ok(format!("{}{}", UFI_PREFIX, suffix))
    }
}

fn fill_entropy(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf).map_err(|e| eyre!("Failed to read OS entropy: {}", e))
}

fn alphanumeric_suffix() -> Result<String> {
    // 252 = 7 * 36; bytes at or above it would bias the low symbols
    const ZONE: u8 = 252;

    let mut suffix = String::with_capacity(ALPHANUMERIC_LEN);
    let mut buf = [0u8; 16];

    while suffix.len() < ALPHANUMERIC_LEN {
        fill_entropy(&mut buf)?;
        for &b in buf.iter().filter(|&&b| b < ZONE) {
            suffix.push(ALPHABET[(b % 36) as usize] as char);
            if suffix.len() == ALPHANUMERIC_LEN {
                break;
            }
        }
    }

    Ok(suffix)
}

fn numeric_suffix() -> Result<u32> {
    let zone = u32::MAX - (u32::MAX % NUMERIC_SPAN);

    loop {
        let mut buf = [0u8; 4];
        fill_entropy(&mut buf)?;
        let value = u32::from_le_bytes(buf);
        if value < zone {
            return Ok(NUMERIC_MIN + value % NUMERIC_SPAN);
        }
    }
}
