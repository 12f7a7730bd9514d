mod token;

pub use token::{SlurmTokenClaims, HEADER_USER_NAME, HEADER_USER_TOKEN, SECRET_KEY_JWT_HS256};
