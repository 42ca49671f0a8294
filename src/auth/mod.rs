pub mod accounts;
pub mod tokens;

pub use accounts::{AccountStore, AuthService, SqliteAccountStore, TokenPair, UserRecord};
pub use tokens::{HmacTokenService, TokenClaims, TokenValidator};
