use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// The key/value key conventionally used to store the slurmrestd HS256 key in a K8s Secret.
pub const SECRET_KEY_JWT_HS256: &str = "jwt_hs256.key";
/// The header carrying the Slurm user name on slurmrestd requests.
pub const HEADER_USER_NAME: &str = "X-SLURM-USER-NAME";
/// The header carrying the Slurm JWT on slurmrestd requests.
pub const HEADER_USER_TOKEN: &str = "X-SLURM-USER-TOKEN";

/// The claims of a JWT accepted by slurmctld's `auth/jwt` plugin.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlurmTokenClaims {
    /// Expiration, as seconds since the epoch.
    pub exp: i64,
    /// Issued at, as seconds since the epoch.
    pub iat: i64,
    /// The Slurm user name this token authenticates as.
    pub sun: String,
}

impl SlurmTokenClaims {
    /// Create a new claims body for the given user, valid for `lifetime` from `now`.
    pub fn new(user: &str, now: DateTime<Utc>, lifetime: Duration) -> Self {
        Self {
            exp: (now + lifetime).timestamp(),
            iat: now.timestamp(),
            sun: user.into(),
        }
    }

    /// Encode this claims body as a JWT signed with the given HS256 key.
    pub fn encode(&self, key: &[u8]) -> Result<String> {
        ensure!(!key.is_empty(), "jwt signing key must not be empty");
        let header = Header::new(Algorithm::HS256);
        jsonwebtoken::encode(&header, &self, &EncodingKey::from_secret(key)).context("error encoding slurm jwt")
    }

    /// Decode & verify the given string as a JWT with a `SlurmTokenClaims` body.
    pub fn decode(token: impl AsRef<str>, key: &[u8]) -> Result<Self> {
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode(token.as_ref(), &DecodingKey::from_secret(key), &validation)
            .map(|body| body.claims)
            .context("error decoding slurm jwt")
    }
}
